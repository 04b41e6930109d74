// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A software task watchdog.
//!
//! A single hardware watchdog can't tell *which* task wedged. This module
//! tracks a feed time per logical channel -- one per task or per critical
//! section, named by an enum the embedder defines:
//!
//! - Create an enum of your channels and derive `Enum` (from the
//!   `enum_map` crate) for it.
//! - `start` a channel when the monitored work begins, `feed` it from the
//!   task's healthy path, `stop` it when the work ends.
//! - Periodically call [`TaskWatchdog::check_all`]; on zero expirations
//!   refresh the hardware watchdog, otherwise let it bite (or assert),
//!   having first logged which channels starved.
//!
//! Time is supplied by the caller in monotonic milliseconds, which keeps
//! the module trivially testable and usable from a timer interrupt.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum ChannelState {
    #[default]
    Stopped,
    Started,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Channel {
    state: ChannelState,
    fed_time_ms: u64,
}

pub struct TaskWatchdog<E: EnumArray<Channel>> {
    channels: EnumMap<E, Channel>,
    timeout_ms: u64,
}

impl<E: EnumArray<Channel> + Copy> TaskWatchdog<E> {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            channels: EnumMap::default(),
            timeout_ms,
        }
    }

    /// Begins monitoring `channel`, counting from `now_ms`.
    pub fn start(&mut self, channel: E, now_ms: u64) {
        self.channels[channel] = Channel {
            state: ChannelState::Started,
            fed_time_ms: now_ms,
        };
    }

    /// Resets `channel`'s expiration deadline.
    pub fn feed(&mut self, channel: E, now_ms: u64) {
        self.channels[channel].fed_time_ms = now_ms;
    }

    /// Stops monitoring `channel`.
    pub fn stop(&mut self, channel: E) {
        self.channels[channel].state = ChannelState::Stopped;
    }

    /// Whether `channel` is started and past its deadline.
    pub fn expired(&self, channel: E, now_ms: u64) -> bool {
        let ch = self.channels[channel];
        ch.state == ChannelState::Started
            && now_ms.saturating_sub(ch.fed_time_ms) > self.timeout_ms
    }

    /// Counts expired channels. Zero means every monitored task is
    /// healthy and the hardware watchdog may be refreshed.
    pub fn check_all(&self, now_ms: u64) -> usize {
        self.iter_expired(now_ms).count()
    }

    /// Iterates the channels currently expired, for reporting before the
    /// system is taken down.
    pub fn iter_expired(&self, now_ms: u64) -> impl Iterator<Item = E> + '_ {
        self.channels
            .iter()
            .filter(move |(_, ch)| {
                ch.state == ChannelState::Started
                    && now_ms.saturating_sub(ch.fed_time_ms) > self.timeout_ms
            })
            .map(|(e, _)| e)
    }
}
