// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A hosted walkthrough of the telemetry pipeline.
//!
//! Simulates two boots of a device: the first one "crashes" (saving a
//! coredump and latching a reboot reason into the persistent region), the
//! second one collects the damage -- reboot event, trace events, logs, a
//! heartbeat, a custom recording -- and drains everything as base64 chunk
//! lines on stdout. Each `MC:...:` line is what a product would POST to
//! the chunks endpoint.

use std::cell::Cell;
use std::time::Instant;

use chunk_export::dump_chunks;
use coredump::{CoredumpDataSource, RamCoredumpStorage, Region, SaveInfo};
use enum_map::Enum;
use event_codec::cdr::{CdrDataSource, CdrMetadata, CdrSource, MIMETYPE_CSV};
use event_codec::envelope::SerializerOptions;
use event_codec::storage::DropStats;
use event_codec::trace::{TraceCapture, TraceEvent};
use event_store::EventStore;
use heartbeat::MetricStore;
use logstore::{LogKind, LogLevel, LogStore};
use packetizer::{Packetizer, Sources};
use reboot_tracking::{
    BootupInfo, RebootReason, RebootTracker, RegInfo, REGION_SIZE,
};
use task_watchdog::TaskWatchdog;
use telemetry_api::{
    BuildId, CurrentTime, DeviceInfo, DevicePlatform, Monotonic,
};

struct DemoPlatform {
    booted_at: Instant,
}

impl DevicePlatform for DemoPlatform {
    fn device_info(&self) -> DeviceInfo<'_> {
        DeviceInfo {
            device_serial: "DEMO123456",
            software_type: "demo-app",
            software_version: env!("CARGO_PKG_VERSION"),
            hardware_version: "host",
        }
    }

    fn build_id(&self) -> Option<BuildId> {
        Some(BuildId(*b"demo-build-id-bytes!"))
    }

    fn current_time(&self) -> CurrentTime {
        match std::time::UNIX_EPOCH.elapsed() {
            Ok(elapsed) => CurrentTime::UnixEpochSecs(elapsed.as_secs()),
            Err(_) => CurrentTime::Unknown,
        }
    }
}

impl Monotonic for DemoPlatform {
    fn time_since_boot_ms(&self) -> u64 {
        self.booted_at.elapsed().as_millis() as u64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
enum WatchedTasks {
    Sampler,
    Uplink,
}

struct SensorRecording {
    csv: &'static [u8],
    consumed: Cell<bool>,
}

impl CdrSource for SensorRecording {
    fn has_cdr(&mut self) -> Option<CdrMetadata<'_>> {
        if self.consumed.get() {
            return None;
        }
        Some(CdrMetadata {
            start_time: CurrentTime::Unknown,
            mimetypes: &[MIMETYPE_CSV],
            data_size_bytes: self.csv.len() as u32,
            duration_ms: 2_000,
            collection_reason: "sensor glitch",
        })
    }

    fn read_data(&mut self, offset: u32, buf: &mut [u8]) -> bool {
        let offset = offset as usize;
        let Some(src) = self.csv.get(offset..offset + buf.len()) else {
            return false;
        };
        buf.copy_from_slice(src);
        true
    }

    fn mark_cdr_read(&mut self) {
        self.consumed.set(true);
    }
}

/// Boot one: hit a "fault", save a coredump, mark the reset.
fn first_boot(
    platform: &DemoPlatform,
    noinit_region: &mut [u8; REGION_SIZE],
    dump_storage: &mut RamCoredumpStorage<'_>,
) {
    let mut tracker = RebootTracker::boot(
        noinit_region,
        Some(BootupInfo {
            reset_reason_reg: 0x1,
            reset_reason: RebootReason::PowerOnReset,
        }),
    );

    // A pretend fault handler: registers and the interesting RAM.
    let fake_stack = [0x5au8; 128];
    let regions = [Region::memory(0x2000_1000, &fake_stack)];
    let saved = coredump::save(
        dump_storage,
        platform,
        &SaveInfo {
            regs: Some(&[0xde, 0xad, 0xbe, 0xef]),
            trace_reason: RebootReason::HardFault as u32,
            arch_regions: &[],
            sdk_regions: &[],
            regions: &regions,
        },
    )
    .expect("coredump save");
    log::info!(
        "boot 1: saved a {} byte coredump (truncated: {})",
        saved.total_size,
        saved.truncated
    );

    tracker.mark_coredump_saved();
    tracker.mark_reset_imminent(
        RebootReason::HardFault,
        Some(RegInfo {
            pc: 0x0800_1234,
            lr: 0x0800_4321,
        }),
    );
}

fn main() {
    env_logger::init();

    let platform = DemoPlatform {
        booted_at: Instant::now(),
    };

    // Stand-ins for the NOINIT RAM region and the coredump flash area.
    let mut noinit_region = [0u8; REGION_SIZE];
    let mut dump_backing = vec![0u8; 2048];
    let mut dump_storage = RamCoredumpStorage::new(&mut dump_backing);

    first_boot(&platform, &mut noinit_region, &mut dump_storage);

    // ---- second boot: collect and drain everything ----

    let mut tracker = RebootTracker::boot(
        &mut noinit_region,
        Some(BootupInfo {
            reset_reason_reg: 0x4,
            reset_reason: RebootReason::SoftwareReset,
        }),
    );
    log::info!(
        "boot 2: crash count {}, unexpected reboot: {}",
        tracker.crash_count(),
        tracker.unexpected_reboot_occurred()
    );

    let opts = SerializerOptions::default();
    let mut stats = DropStats::default();

    let mut event_backing = vec![0u8; 1024];
    let mut events = EventStore::new(&mut event_backing);
    event_codec::reboot::collect_reset_info(
        &mut tracker,
        &mut events,
        &mut stats,
        &platform,
        opts,
    )
    .expect("reset info collection");

    // Heartbeat metrics for this session.
    let mut metrics: MetricStore<'_, 8, 1> = MetricStore::new(&platform);
    let session = metrics.define_session_metrics().expect("metric defs");
    let sample_count = metrics.define_unsigned("sample_count").unwrap();
    metrics
        .begin_session(
            &session,
            u32::from(tracker.crash_count()),
            tracker.unexpected_reboot_occurred(),
        )
        .unwrap();

    // The watchdog notices the sampler wedging.
    let mut watchdog: TaskWatchdog<WatchedTasks> = TaskWatchdog::new(1_000);
    let now = platform.time_since_boot_ms();
    watchdog.start(WatchedTasks::Sampler, now);
    watchdog.start(WatchedTasks::Uplink, now);

    let mut capture = TraceCapture::new(opts);
    let mut log_backing = vec![0u8; 512];
    let mut logs = LogStore::new(&mut log_backing, &platform, opts);

    // Simulated runtime activity.
    for i in 0..5 {
        metrics.add(sample_count, 1).unwrap();
        let line = format!("sample {i} collected");
        let _ = logs.save(LogLevel::Info, LogKind::Preformatted, line.as_bytes());
        // The uplink task stays healthy; the sampler never feeds again.
        watchdog.feed(WatchedTasks::Uplink, now + 1_800);
    }
    let _ = logs.save(
        LogLevel::Error,
        LogKind::Preformatted,
        b"sampler stopped responding",
    );
    if watchdog.check_all(now + 2_000) > 0 {
        for task in watchdog.iter_expired(now + 2_000) {
            capture
                .capture(
                    &mut events,
                    &mut stats,
                    &platform,
                    &TraceEvent::with_log(
                        1,
                        format_args!("task watchdog expired: {task:?}"),
                    ),
                )
                .expect("trace capture");
        }
    }

    assert!(metrics.collect_heartbeat(&mut events, &mut stats, &platform, opts));
    logs.trigger_collection();

    let mut recording = SensorRecording {
        csv: b"t_ms,raw\n0,512\n10,518\n20,3\n",
        consumed: Cell::new(false),
    };
    let mut cdr = CdrDataSource::new(&platform, opts);
    cdr.register(&mut recording).expect("cdr registration");

    // Drain the lot, coredump first.
    let mut dump_source = CoredumpDataSource::new(&mut dump_storage);
    let mut packetizer = Packetizer::new(Sources {
        coredump: Some(&mut dump_source),
        event: Some(&mut events),
        log: Some(&mut logs),
        cdr: Some(&mut cdr),
    });

    let mut sink = |line: &str| println!("{line}");
    let exported = dump_chunks(&mut packetizer, &mut sink);
    log::info!(
        "exported {exported} chunks, drop count {}",
        stats.read_drop_count()
    );
}
