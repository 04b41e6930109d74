// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Heartbeat metrics: periodic aggregate measurements.
//!
//! A heartbeat is a snapshot of a fixed set of metric values, serialized as
//! one event at a regular interval and then reset, so each event describes
//! exactly one interval. Metrics are defined once at boot (the set and its
//! order are part of the wire contract -- values are sent as a bare array,
//! not a map) and updated from anywhere in the firmware.
//!
//! Four kinds of metric exist:
//!
//! - **Unsigned** / **Signed** counters and gauges, with saturating
//!   [`add`](MetricStore::add).
//! - **Timer** metrics accumulate elapsed wall time between
//!   [`timer_start`](MetricStore::timer_start) and
//!   [`timer_stop`](MetricStore::timer_stop). Timestamps are tracked in 31
//!   bits of milliseconds (the 32nd bit would only matter for intervals over
//!   ~25 days); a timer still running when the heartbeat is collected is
//!   sampled and restarted so no elapsed time is lost between intervals.
//! - **String** values, stored in a side table so the value slots stay
//!   small.
//!
//! Values are zeroed after every collection, successful or not.

#![cfg_attr(not(test), no_std)]

use event_codec::envelope::SerializerOptions;
use event_codec::keys::{self, EventType};
use event_codec::storage::{encode_to_storage, DropStats};
use event_store::EventSink;
use heapless::{String, Vec};
use telemetry_api::{DevicePlatform, Monotonic};
use wirecbor::{compute_size, Encoder, NotEnoughSpace};

/// Cap on stored string metric values, excluding any terminator.
pub const MAX_METRIC_STRING_LEN: usize = 32;

/// Timers track 31 bits of milliseconds; the top bit is reserved.
const TIMER_VAL_MAX: u32 = 0x8000_0000;

/// Handle to a defined metric. Only valid for the store that defined it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MetricId(u16);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Unsigned,
    Signed,
    Timer,
    String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetricError {
    /// No room left for another metric definition.
    RegistryFull,
    /// The operation does not apply to the metric's kind.
    TypeMismatch,
    /// The timer was already in the requested state. Returned so unbalanced
    /// start/stop pairs are easy to catch.
    NoChange,
}

enum MetricValue {
    Unsigned(u32),
    Signed(i32),
    Timer {
        total_ms: u32,
        running: bool,
        /// 31-bit start timestamp, valid while running.
        started_at_ms: u32,
    },
    /// Index into the string side table.
    Str { slot: u8 },
}

struct Metric {
    name: &'static str,
    value: MetricValue,
}

/// A read-only view of one metric, for iteration and debug dumps.
pub enum MetricReading<'a> {
    Unsigned(u32),
    Signed(i32),
    /// Accumulated milliseconds, not including a still-running span.
    Timer(u32),
    Str(&'a str),
}

/// The metric registry and value store.
///
/// `N` bounds the number of metrics, `S` the number of string metrics.
pub struct MetricStore<'a, const N: usize, const S: usize> {
    mono: &'a dyn Monotonic,
    metrics: Vec<Metric, N>,
    strings: Vec<String<MAX_METRIC_STRING_LEN>, S>,
}

#[derive(Clone, Copy)]
enum TimerOp {
    Start,
    Stop,
    /// Sample a running timer and restart it, so serialization loses no
    /// elapsed time.
    ForceValueUpdate,
}

impl<'a, const N: usize, const S: usize> MetricStore<'a, N, S> {
    pub fn new(mono: &'a dyn Monotonic) -> Self {
        Self {
            mono,
            metrics: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn define(
        &mut self,
        name: &'static str,
        value: MetricValue,
    ) -> Result<MetricId, MetricError> {
        let id = MetricId(self.metrics.len() as u16);
        self.metrics
            .push(Metric { name, value })
            .map_err(|_| MetricError::RegistryFull)?;
        Ok(id)
    }

    pub fn define_unsigned(
        &mut self,
        name: &'static str,
    ) -> Result<MetricId, MetricError> {
        self.define(name, MetricValue::Unsigned(0))
    }

    pub fn define_signed(
        &mut self,
        name: &'static str,
    ) -> Result<MetricId, MetricError> {
        self.define(name, MetricValue::Signed(0))
    }

    pub fn define_timer(
        &mut self,
        name: &'static str,
    ) -> Result<MetricId, MetricError> {
        self.define(
            name,
            MetricValue::Timer {
                total_ms: 0,
                running: false,
                started_at_ms: 0,
            },
        )
    }

    pub fn define_string(
        &mut self,
        name: &'static str,
    ) -> Result<MetricId, MetricError> {
        let slot = self.strings.len() as u8;
        self.strings
            .push(String::new())
            .map_err(|_| MetricError::RegistryFull)?;
        self.define(name, MetricValue::Str { slot })
    }

    pub fn num_metrics(&self) -> usize {
        self.metrics.len()
    }

    fn metric_mut(&mut self, id: MetricId) -> &mut MetricValue {
        &mut self.metrics[id.0 as usize].value
    }

    pub fn set_unsigned(
        &mut self,
        id: MetricId,
        value: u32,
    ) -> Result<(), MetricError> {
        match self.metric_mut(id) {
            MetricValue::Unsigned(v) => {
                *v = value;
                Ok(())
            }
            _ => Err(MetricError::TypeMismatch),
        }
    }

    pub fn set_signed(
        &mut self,
        id: MetricId,
        value: i32,
    ) -> Result<(), MetricError> {
        match self.metric_mut(id) {
            MetricValue::Signed(v) => {
                *v = value;
                Ok(())
            }
            _ => Err(MetricError::TypeMismatch),
        }
    }

    pub fn set_string(
        &mut self,
        id: MetricId,
        value: &str,
    ) -> Result<(), MetricError> {
        let slot = match self.metric_mut(id) {
            MetricValue::Str { slot } => *slot as usize,
            _ => return Err(MetricError::TypeMismatch),
        };
        let stored = &mut self.strings[slot];
        stored.clear();
        // Truncate to capacity rather than failing; partial telemetry beats
        // none. Respect char boundaries when cutting.
        let mut end = value.len().min(MAX_METRIC_STRING_LEN);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        // Cannot fail: end <= capacity.
        let _ = stored.push_str(&value[..end]);
        Ok(())
    }

    /// Adds `amount` to a counter metric, clamping at the numeric limits.
    pub fn add(&mut self, id: MetricId, amount: i32) -> Result<(), MetricError> {
        match self.metric_mut(id) {
            MetricValue::Signed(v) => {
                *v = (*v as i64 + amount as i64)
                    .clamp(i32::MIN as i64, i32::MAX as i64)
                    as i32;
                Ok(())
            }
            MetricValue::Unsigned(v) => {
                let new = *v as i64 + amount as i64;
                *v = new.clamp(0, u32::MAX as i64) as u32;
                Ok(())
            }
            _ => Err(MetricError::TypeMismatch),
        }
    }

    fn now_ms31(&self) -> u32 {
        (self.mono.time_since_boot_ms() as u32) & !TIMER_VAL_MAX
    }

    fn update_timer(
        &mut self,
        id: MetricId,
        op: TimerOp,
    ) -> Result<(), MetricError> {
        let now = self.now_ms31();
        let MetricValue::Timer {
            total_ms,
            running,
            started_at_ms,
        } = self.metric_mut(id)
        else {
            return Err(MetricError::TypeMismatch);
        };

        match (op, *running) {
            (TimerOp::Start, false) => {
                *started_at_ms = now;
                *running = true;
                Ok(())
            }
            (TimerOp::Stop, true) | (TimerOp::ForceValueUpdate, true) => {
                let delta = if now >= *started_at_ms {
                    now - *started_at_ms
                } else {
                    // The 31-bit clock wrapped during the span.
                    TIMER_VAL_MAX - *started_at_ms + now
                };
                *total_ms = total_ms.wrapping_add(delta);

                if matches!(op, TimerOp::Stop) {
                    *started_at_ms = 0;
                    *running = false;
                } else {
                    *started_at_ms = now;
                }
                Ok(())
            }
            // Already in the requested state; no update took place.
            _ => Err(MetricError::NoChange),
        }
    }

    pub fn timer_start(&mut self, id: MetricId) -> Result<(), MetricError> {
        self.update_timer(id, TimerOp::Start)
    }

    pub fn timer_stop(&mut self, id: MetricId) -> Result<(), MetricError> {
        self.update_timer(id, TimerOp::Stop)
    }

    pub fn read_unsigned(&self, id: MetricId) -> Result<u32, MetricError> {
        match self.metrics[id.0 as usize].value {
            MetricValue::Unsigned(v) => Ok(v),
            _ => Err(MetricError::TypeMismatch),
        }
    }

    pub fn read_signed(&self, id: MetricId) -> Result<i32, MetricError> {
        match self.metrics[id.0 as usize].value {
            MetricValue::Signed(v) => Ok(v),
            _ => Err(MetricError::TypeMismatch),
        }
    }

    pub fn timer_read(&self, id: MetricId) -> Result<u32, MetricError> {
        match self.metrics[id.0 as usize].value {
            MetricValue::Timer { total_ms, .. } => Ok(total_ms),
            _ => Err(MetricError::TypeMismatch),
        }
    }

    pub fn read_string(&self, id: MetricId) -> Result<&str, MetricError> {
        match self.metrics[id.0 as usize].value {
            MetricValue::Str { slot } => Ok(&self.strings[slot as usize]),
            _ => Err(MetricError::TypeMismatch),
        }
    }

    /// Iterates metrics in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, MetricReading<'_>)> {
        self.metrics.iter().map(|m| {
            let reading = match m.value {
                MetricValue::Unsigned(v) => MetricReading::Unsigned(v),
                MetricValue::Signed(v) => MetricReading::Signed(v),
                MetricValue::Timer { total_ms, .. } => {
                    MetricReading::Timer(total_ms)
                }
                MetricValue::Str { slot } => {
                    MetricReading::Str(&self.strings[slot as usize])
                }
            };
            (m.name, reading)
        })
    }

    fn encode_heartbeat(
        &self,
        e: &mut Encoder<'_>,
        platform: &dyn DevicePlatform,
        opts: SerializerOptions,
        worst_case: bool,
    ) -> Result<(), NotEnoughSpace> {
        event_codec::envelope::encode_metadata(
            e,
            EventType::Heartbeat,
            platform,
            opts,
        )?;
        e.unsigned(keys::event::EVENT_INFO)?;
        e.map_begin(1)?;
        e.unsigned(keys::heartbeat_info::METRICS)?;
        e.array_begin(self.metrics.len())?;

        for metric in &self.metrics {
            match &metric.value {
                MetricValue::Unsigned(v) => {
                    e.unsigned(if worst_case { u32::MAX } else { *v })?
                }
                MetricValue::Timer { total_ms, .. } => e.unsigned(
                    if worst_case { u32::MAX } else { *total_ms },
                )?,
                MetricValue::Signed(v) => {
                    e.signed(if worst_case { i32::MIN } else { *v })?
                }
                MetricValue::Str { slot } => {
                    if worst_case {
                        // A string value can use its full capacity.
                        let mut filler = String::<MAX_METRIC_STRING_LEN>::new();
                        for _ in 0..MAX_METRIC_STRING_LEN {
                            let _ = filler.push('x');
                        }
                        e.str(&filler)?
                    } else {
                        e.str(&self.strings[*slot as usize])?
                    }
                }
            }
        }
        Ok(())
    }

    /// Serializes the current values as one heartbeat event and resets them.
    ///
    /// Running timers are sampled and restarted first. Values reset whether
    /// or not the event fit in storage, so a failed heartbeat never smears
    /// its interval into the next one.
    pub fn collect_heartbeat(
        &mut self,
        sink: &mut dyn EventSink,
        stats: &mut DropStats,
        platform: &dyn DevicePlatform,
        opts: SerializerOptions,
    ) -> bool {
        for idx in 0..self.metrics.len() {
            // Ignore NoChange from stopped timers.
            let _ = self
                .update_timer(MetricId(idx as u16), TimerOp::ForceValueUpdate);
        }

        let this = &*self;
        let success = encode_to_storage(sink, stats, |e| {
            this.encode_heartbeat(e, platform, opts, false)
        });

        self.reset_values();
        success
    }

    /// Worst-case serialized size of a heartbeat, for sizing storage.
    pub fn worst_case_size(
        &self,
        platform: &dyn DevicePlatform,
        opts: SerializerOptions,
    ) -> usize {
        compute_size(|e| self.encode_heartbeat(e, platform, opts, true))
    }

    fn reset_values(&mut self) {
        for metric in &mut self.metrics {
            match &mut metric.value {
                MetricValue::Unsigned(v) => *v = 0,
                MetricValue::Signed(v) => *v = 0,
                // A running timer keeps running into the next interval;
                // ForceValueUpdate already restarted its base.
                MetricValue::Timer { total_ms, .. } => *total_ms = 0,
                MetricValue::Str { .. } => {}
            }
        }
        for s in &mut self.strings {
            s.clear();
        }
    }
}

/// Handles for the session metrics every heartbeat carries.
pub struct SessionMetrics {
    /// Measures the actual heartbeat interval.
    pub interval_ms: MetricId,
    /// Crash counter carried over from reboot tracking.
    pub unexpected_reboot_count: MetricId,
    /// Whether this boot followed an unexpected reboot.
    pub unexpected_reboot_did_occur: MetricId,
}

impl<'a, const N: usize, const S: usize> MetricStore<'a, N, S> {
    /// Defines the standard session metrics. Call before user metrics if
    /// a stable array position for them matters to your decoder.
    pub fn define_session_metrics(
        &mut self,
    ) -> Result<SessionMetrics, MetricError> {
        Ok(SessionMetrics {
            interval_ms: self.define_timer("interval_ms")?,
            unexpected_reboot_count: self
                .define_unsigned("unexpected_reboot_count")?,
            unexpected_reboot_did_occur: self
                .define_unsigned("unexpected_reboot_did_occur")?,
        })
    }

    /// Seeds the session metrics at boot and starts the interval timer.
    pub fn begin_session(
        &mut self,
        ids: &SessionMetrics,
        unexpected_reboot_count: u32,
        unexpected_reboot_occurred: bool,
    ) -> Result<(), MetricError> {
        self.timer_start(ids.interval_ms)?;
        self.set_unsigned(
            ids.unexpected_reboot_count,
            unexpected_reboot_count,
        )?;
        self.set_unsigned(
            ids.unexpected_reboot_did_occur,
            u32::from(unexpected_reboot_occurred),
        )
    }
}
