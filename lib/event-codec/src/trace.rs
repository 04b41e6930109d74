// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace events: short structured records of notable firmware events.
//!
//! A trace event carries a user-defined reason plus optional program
//! counter, link register, status code, and a captured log line. Capture is
//! legal from interrupt context: an ISR capture is deferred into a single
//! pending slot and flushed into event storage on the next thread-context
//! capture (or explicitly), so the ISR path never touches the storage lock.
//!
//! The pending slot's claim is the `reason` word: the slot is free while it
//! holds [`TRACE_REASON_UNKNOWN`] and owned otherwise. The claim uses an
//! explicit atomic compare-exchange; the payload behind it is written by
//! exactly one ISR (the one that won the claim) and read only by the
//! thread-context flush, which observes the claim before touching the
//! payload. This matches the single-core interrupt model the capture API is
//! specified for -- an ISR runs to completion before the thread resumes.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use event_store::EventSink;
use heapless::Vec;
use telemetry_api::DevicePlatform;
use wirecbor::{compute_size, Encoder, NotEnoughSpace};

use crate::envelope::{
    self, encode_i32_kv, encode_u32_kv, SerializerOptions,
};
use crate::keys::{self, EventType};
use crate::storage::{encode_to_storage, DropStats};

/// Reason value reserved to mean "no reason": user reasons start at 1.
pub const TRACE_REASON_UNKNOWN: u32 = 0;

/// Cap on a log captured alongside a trace event.
pub const MAX_TRACE_LOG_LEN: usize = 128;

/// A log line attached to a trace event.
///
/// Preformatted text goes out as a CBOR byte string; a compact log is
/// already CBOR and is spliced into the stream as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceLog {
    Preformatted(Vec<u8, MAX_TRACE_LOG_LEN>),
    Compact(Vec<u8, MAX_TRACE_LOG_LEN>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceEvent {
    /// User-defined reason; must not be [`TRACE_REASON_UNKNOWN`].
    pub reason: u32,
    /// Address the event was captured at, or 0 to omit.
    pub pc: u32,
    /// Caller return address, or 0 to omit.
    pub lr: u32,
    pub status_code: Option<i32>,
    pub log: Option<TraceLog>,
}

impl TraceEvent {
    /// Builds a trace event carrying a formatted log line, truncated to
    /// [`MAX_TRACE_LOG_LEN`].
    ///
    /// ```
    /// # use event_codec::trace::TraceEvent;
    /// let event =
    ///     TraceEvent::with_log(3, format_args!("rc={} after retry", -5));
    /// ```
    pub fn with_log(reason: u32, args: core::fmt::Arguments<'_>) -> Self {
        struct Truncating(Vec<u8, MAX_TRACE_LOG_LEN>);
        impl core::fmt::Write for Truncating {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                // Keep what fits; a cut-off log beats no log.
                let room = self.0.capacity() - self.0.len();
                let _ = self.0.extend_from_slice(
                    &s.as_bytes()[..s.len().min(room)],
                );
                Ok(())
            }
        }

        let mut log = Truncating(Vec::new());
        let _ = core::fmt::write(&mut log, args);
        Self {
            reason,
            log: Some(TraceLog::Preformatted(log.0)),
            ..Self::default()
        }
    }
}

/// Fields shared by every trace-shaped event; the reboot-record serializer
/// reuses this with its own reason key.
pub struct TraceEventFields {
    pub reason_key: u32,
    pub reason_value: u32,
    pub pc: u32,
    pub lr: u32,
    /// Event-info pairs the caller will append after this helper returns.
    pub extra_pairs: usize,
}

/// Encodes the envelope, the `event_info` key, and the common trace fields.
/// The caller appends `fields.extra_pairs` further pairs.
pub fn encode_trace_fields(
    e: &mut Encoder<'_>,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
    fields: &TraceEventFields,
) -> Result<(), NotEnoughSpace> {
    envelope::encode_metadata(e, EventType::Trace, platform, opts)?;

    let num_pairs = 1 // reason
        + usize::from(fields.pc != 0)
        + usize::from(fields.lr != 0)
        + fields.extra_pairs;

    e.unsigned(keys::event::EVENT_INFO)?;
    e.map_begin(num_pairs)?;

    encode_u32_kv(e, fields.reason_key, fields.reason_value)?;
    if fields.pc != 0 {
        encode_u32_kv(e, keys::trace_info::PROGRAM_COUNTER, fields.pc)?;
    }
    if fields.lr != 0 {
        encode_u32_kv(e, keys::trace_info::LINK_REGISTER, fields.lr)?;
    }
    Ok(())
}

fn encode_trace_event(
    e: &mut Encoder<'_>,
    platform: &dyn DevicePlatform,
    opts: SerializerOptions,
    event: &TraceEvent,
) -> Result<(), NotEnoughSpace> {
    let extra_pairs = usize::from(event.status_code.is_some())
        + usize::from(event.log.is_some());

    let fields = TraceEventFields {
        reason_key: keys::trace_info::USER_REASON,
        reason_value: event.reason,
        pc: event.pc,
        lr: event.lr,
        extra_pairs,
    };
    encode_trace_fields(e, platform, opts, &fields)?;

    if let Some(status) = event.status_code {
        encode_i32_kv(e, keys::trace_info::STATUS_CODE, status)?;
    }

    match &event.log {
        Some(TraceLog::Preformatted(log)) => {
            e.unsigned(keys::trace_info::LOG)?;
            e.bytes(log)?;
        }
        Some(TraceLog::Compact(log)) => {
            e.unsigned(keys::trace_info::COMPACT_LOG)?;
            e.join(log)?;
        }
        None => {}
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureError {
    /// Event storage could not hold the serialized event.
    OutOfSpace,
    /// An ISR capture found the pending slot already claimed.
    SlotBusy,
}

/// The single deferred-capture slot shared between ISR and thread context.
struct IsrSlot {
    /// [`TRACE_REASON_UNKNOWN`] while the slot is free; the claiming
    /// event's reason otherwise.
    reason: AtomicU32,
    event: UnsafeCell<TraceEvent>,
}

pub struct TraceCapture {
    opts: SerializerOptions,
    isr: IsrSlot,
}

// SAFETY: the UnsafeCell payload is guarded by the `reason` claim word per
// the single-writer/single-reader protocol described in the module docs.
unsafe impl Sync for TraceCapture {}

impl TraceCapture {
    pub const fn new(opts: SerializerOptions) -> Self {
        Self {
            opts,
            isr: IsrSlot {
                reason: AtomicU32::new(TRACE_REASON_UNKNOWN),
                event: UnsafeCell::new(TraceEvent {
                    reason: TRACE_REASON_UNKNOWN,
                    pc: 0,
                    lr: 0,
                    status_code: None,
                    log: None,
                }),
            },
        }
    }

    /// Captures a trace event from thread context.
    ///
    /// Any pending ISR event is flushed first so the stored order matches
    /// the capture order.
    pub fn capture(
        &mut self,
        sink: &mut dyn EventSink,
        stats: &mut DropStats,
        platform: &dyn DevicePlatform,
        event: &TraceEvent,
    ) -> Result<(), CaptureError> {
        self.flush_isr_event(sink, stats, platform)?;
        self.store(sink, stats, platform, event)
    }

    /// Captures a trace event from interrupt context.
    ///
    /// Cheap by design: the event is copied into the pending slot and
    /// serialized later from thread context. Only one event can be pending;
    /// a second ISR capture before the flush is rejected.
    pub fn capture_from_isr(
        &self,
        event: &TraceEvent,
    ) -> Result<(), CaptureError> {
        if self
            .isr
            .reason
            .compare_exchange(
                TRACE_REASON_UNKNOWN,
                event.reason,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return Err(CaptureError::SlotBusy);
        }

        // SAFETY: the compare-exchange above made this context the slot's
        // sole owner; the flush side will not read the payload until it
        // observes the claim, which on the single-core target means after
        // this ISR has returned.
        unsafe { *self.isr.event.get() = event.clone() };
        Ok(())
    }

    /// Serializes the pending ISR event, if any, into storage.
    pub fn flush_isr_event(
        &mut self,
        sink: &mut dyn EventSink,
        stats: &mut DropStats,
        platform: &dyn DevicePlatform,
    ) -> Result<(), CaptureError> {
        if self.isr.reason.load(Ordering::Acquire) == TRACE_REASON_UNKNOWN {
            return Ok(());
        }

        // SAFETY: the slot is claimed, so the ISR side will not touch the
        // payload; `&mut self` keeps other flushes out.
        let event = unsafe { (*self.isr.event.get()).clone() };
        self.store(sink, stats, platform, &event)?;

        // Successfully flushed; free the slot for the next ISR capture.
        self.isr
            .reason
            .store(TRACE_REASON_UNKNOWN, Ordering::Release);
        Ok(())
    }

    fn store(
        &self,
        sink: &mut dyn EventSink,
        stats: &mut DropStats,
        platform: &dyn DevicePlatform,
        event: &TraceEvent,
    ) -> Result<(), CaptureError> {
        let opts = self.opts;
        if encode_to_storage(sink, stats, |e| {
            encode_trace_event(e, platform, opts, event)
        }) {
            Ok(())
        } else {
            Err(CaptureError::OutOfSpace)
        }
    }

    /// Worst-case serialized size of a trace event, for sizing storage.
    pub fn worst_case_size(&self, platform: &dyn DevicePlatform) -> usize {
        let event = TraceEvent {
            reason: u32::MAX,
            pc: u32::MAX,
            lr: u32::MAX,
            status_code: Some(i32::MAX),
            log: None,
        };
        let opts = self.opts;
        compute_size(|e| encode_trace_event(e, platform, opts, &event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{envelope_prefix, FakePlatform};
    use event_store::EventStore;
    use telemetry_api::DataSource;

    fn read_event(store: &mut EventStore<'_>) -> Vec<u8, 256> {
        let total = store.has_more_msgs().unwrap();
        let mut buf = [0u8; 256];
        assert!(store.read_msg(0, &mut buf[..total]));
        store.mark_msg_read();
        Vec::from_slice(&buf[..total]).unwrap()
    }

    #[test]
    fn trace_event_with_pc_and_lr() {
        let mut backing = [0u8; 128];
        let mut store = EventStore::new(&mut backing);
        let mut stats = DropStats::default();
        let mut capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();

        capture
            .capture(
                &mut store,
                &mut stats,
                &platform,
                &TraceEvent {
                    reason: 3,
                    pc: 0x1234_5678,
                    lr: 0xaabb_ccdd,
                    ..TraceEvent::default()
                },
            )
            .unwrap();

        let mut expected = envelope_prefix(6, 2);
        expected.extend_from_slice(&[
            0x04, 0xa3, // event_info: 3 pairs
            0x06, 0x03, // user reason
            0x02, 0x1a, 0x12, 0x34, 0x56, 0x78, // pc
            0x03, 0x1a, 0xaa, 0xbb, 0xcc, 0xdd, // lr
        ]);
        assert_eq!(read_event(&mut store).as_slice(), expected.as_slice());
    }

    #[test]
    fn status_code_and_log_are_optional_pairs() {
        let mut backing = [0u8; 192];
        let mut store = EventStore::new(&mut backing);
        let mut stats = DropStats::default();
        let mut capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();

        capture
            .capture(
                &mut store,
                &mut stats,
                &platform,
                &TraceEvent {
                    reason: 1,
                    status_code: Some(-22),
                    log: Some(TraceLog::Preformatted(
                        Vec::from_slice(b"i2c timeout").unwrap(),
                    )),
                    ..TraceEvent::default()
                },
            )
            .unwrap();

        let mut expected = envelope_prefix(6, 2);
        expected.extend_from_slice(&[0x04, 0xa3, 0x06, 0x01]);
        expected.extend_from_slice(&[0x07, 0x35]); // status: -22
        expected.extend_from_slice(&[0x08, 0x4b]); // log: 11-byte string
        expected.extend_from_slice(b"i2c timeout");
        assert_eq!(read_event(&mut store).as_slice(), expected.as_slice());
    }

    #[test]
    fn with_log_formats_and_truncates() {
        let event = TraceEvent::with_log(5, format_args!("rc={}", -7));
        assert_eq!(event.reason, 5);
        assert_eq!(
            event.log,
            Some(TraceLog::Preformatted(
                Vec::from_slice(b"rc=-7").unwrap()
            ))
        );

        let long = "y".repeat(MAX_TRACE_LOG_LEN * 2);
        let event = TraceEvent::with_log(5, format_args!("{long}"));
        let Some(TraceLog::Preformatted(log)) = event.log else {
            panic!("log missing");
        };
        assert_eq!(log.len(), MAX_TRACE_LOG_LEN);
    }

    #[test]
    fn isr_capture_defers_until_flush() {
        let mut backing = [0u8; 192];
        let mut store = EventStore::new(&mut backing);
        let mut stats = DropStats::default();
        let mut capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();

        capture
            .capture_from_isr(&TraceEvent {
                reason: 7,
                ..TraceEvent::default()
            })
            .unwrap();
        assert!(store.has_more_msgs().is_none());

        // A second ISR capture loses: the slot is single-entry.
        assert_eq!(
            capture.capture_from_isr(&TraceEvent {
                reason: 8,
                ..TraceEvent::default()
            }),
            Err(CaptureError::SlotBusy)
        );

        capture
            .flush_isr_event(&mut store, &mut stats, &platform)
            .unwrap();
        let event = read_event(&mut store);
        // event_info carries the ISR event's reason.
        assert!(event
            .windows(3)
            .any(|w| w == [0xa1, 0x06, 0x07]));

        // The slot is free again.
        capture
            .capture_from_isr(&TraceEvent {
                reason: 9,
                ..TraceEvent::default()
            })
            .unwrap();
    }

    #[test]
    fn thread_capture_flushes_pending_isr_event_first() {
        let mut backing = [0u8; 256];
        let mut store = EventStore::new(&mut backing);
        let mut stats = DropStats::default();
        let mut capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();

        capture
            .capture_from_isr(&TraceEvent {
                reason: 7,
                ..TraceEvent::default()
            })
            .unwrap();
        capture
            .capture(
                &mut store,
                &mut stats,
                &platform,
                &TraceEvent {
                    reason: 2,
                    ..TraceEvent::default()
                },
            )
            .unwrap();

        // Two events stored, ISR one first.
        let first = read_event(&mut store);
        assert!(first.windows(3).any(|w| w == [0xa1, 0x06, 0x07]));
        let second = read_event(&mut store);
        assert!(second.windows(3).any(|w| w == [0xa1, 0x06, 0x02]));
    }

    #[test]
    fn worst_case_size_covers_real_events() {
        let capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();
        let worst = capture.worst_case_size(&platform);

        let event = TraceEvent {
            reason: 500,
            pc: 0x2000_0000,
            lr: 0x2000_0004,
            status_code: Some(-1),
            log: None,
        };
        let opts = SerializerOptions::default();
        let actual = compute_size(|e| {
            encode_trace_event(e, &platform, opts, &event)
        });
        assert!(actual <= worst, "{actual} > {worst}");
    }

    #[test]
    fn out_of_space_reports_error() {
        let mut backing = [0u8; 8];
        let mut store = EventStore::new(&mut backing);
        let mut stats = DropStats::default();
        let mut capture = TraceCapture::new(SerializerOptions::default());
        let platform = FakePlatform::default();

        assert_eq!(
            capture.capture(
                &mut store,
                &mut stats,
                &platform,
                &TraceEvent {
                    reason: 1,
                    ..TraceEvent::default()
                },
            ),
            Err(CaptureError::OutOfSpace)
        );
        assert_eq!(stats.read_drop_count(), 1);
    }
}
