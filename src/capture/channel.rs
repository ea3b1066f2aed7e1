//! Per-channel capture actor.
//!
//! Each channel owns exactly one actor thread running the resequencer →
//! minute-writer chain; other components only see its bounded packet queue
//! or counter snapshots. State machine:
//! INIT → BUFFERING (filling the tone-search buffer) → ARMED (anchor
//! established, waiting for the :00 crossing) → RECORDING. RECORDING falls
//! back to BUFFERING only on a stream restart.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use num_complex::Complex32;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::archive::{Discontinuity, DiscontinuityReason, MinuteArchive};
use crate::capture::minute::MinuteWriter;
use crate::capture::npz;
use crate::capture::resequencer::{RawPacket, Resequencer, SeqEvent};
use crate::capture::rtp::decode_iq;
use crate::config::{ChannelConfig, TimeSnapConfig};
use crate::dsp::{envelope, remove_dc};
use crate::error::RecorderError;
use crate::station::Station;
use crate::timing::ntp::NtpCache;
use crate::timing::time_snap::{
    confidence_from_snr, fallback_anchor, AnchorTracker, TimeSnap, ToneSearcher,
};

/// Archive-write retry schedule.
const WRITE_RETRIES: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(250);

/// In-memory spool capacity for archives that failed to hit disk.
const SPOOL_CAPACITY: usize = 4;

/// Seconds of the previous minute kept for the tone alignment check.
const ALIGNMENT_TAIL_SECS: usize = 1;
/// Seconds of the new minute searched for its tone edge.
const ALIGNMENT_HEAD_SECS: usize = 2;

/// One unit of the startup capture, kept with packet boundaries so the
/// replay into the minute writer preserves per-packet accounting.
enum StartupChunk {
    Samples { rtp: u32, data: Vec<Complex32> },
    Gap { rtp: u32, missing: u32, packets_lost: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelState {
    Init,
    Buffering,
    Armed,
    Recording,
}

/// Bounded drop-oldest packet queue between the demultiplexer and the
/// actor. Overflow drops the oldest packet; the resequencer then sees the
/// hole as a sequence jump and fills it.
pub struct PacketQueue {
    inner: Mutex<VecDeque<RawPacket>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, pkt: RawPacket) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(pkt);
        drop(q);
        self.ready.notify_one();
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<RawPacket> {
        let mut q = self.inner.lock();
        if q.is_empty() {
            self.ready.wait_for(&mut q, timeout);
        }
        q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Counters exposed to the status writer; owned by the actor, read by
/// snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub ssrc: u32,
    pub state: ChannelState,
    pub minutes_written: u64,
    pub last_minute_utc: Option<f64>,
    pub gaps: u64,
    pub restarts: u64,
    pub corrections: u64,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub spooled: usize,
    pub write_failures: u64,
    pub time_snap_source: Option<String>,
    pub time_snap_confidence: Option<f64>,
}

struct StatusInner {
    state: ChannelState,
    minutes_written: u64,
    last_minute_utc: Option<f64>,
    gaps: u64,
    restarts: u64,
    corrections: u64,
    spooled: usize,
    write_failures: u64,
    time_snap_source: Option<String>,
    time_snap_confidence: Option<f64>,
}

/// Handle shared between the actor, the demultiplexer and the status task.
pub struct ChannelShared {
    pub config: ChannelConfig,
    pub queue: PacketQueue,
    status: Mutex<StatusInner>,
}

impl ChannelShared {
    pub fn new(config: ChannelConfig) -> Self {
        // One minute of packets; samples-per-packet is not yet known, so
        // assume a conservative payload of 256 samples.
        let capacity = (config.sample_rate as usize * 60 / 256).max(64);
        Self {
            config,
            queue: PacketQueue::new(capacity),
            status: Mutex::new(StatusInner {
                state: ChannelState::Init,
                minutes_written: 0,
                last_minute_utc: None,
                gaps: 0,
                restarts: 0,
                corrections: 0,
                spooled: 0,
                write_failures: 0,
                time_snap_source: None,
                time_snap_confidence: None,
            }),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        let s = self.status.lock();
        ChannelStatus {
            channel: self.config.description.clone(),
            ssrc: self.config.ssrc,
            state: s.state,
            minutes_written: s.minutes_written,
            last_minute_utc: s.last_minute_utc,
            gaps: s.gaps,
            restarts: s.restarts,
            corrections: s.corrections,
            queue_depth: self.queue.len(),
            queue_dropped: self.queue.dropped(),
            spooled: s.spooled,
            write_failures: s.write_failures,
            time_snap_source: s.time_snap_source.clone(),
            time_snap_confidence: s.time_snap_confidence,
        }
    }
}

/// The capture actor for one channel.
pub struct ChannelActor {
    shared: Arc<ChannelShared>,
    ts_config: TimeSnapConfig,
    archive_dir: PathBuf,
    ntp: Arc<NtpCache>,

    searcher: ToneSearcher,
    resequencer: Resequencer,
    writer: Option<MinuteWriter>,
    tracker: Option<AnchorTracker>,
    station: Option<Station>,

    /// Startup tone-search buffer (BUFFERING state), kept with packet
    /// boundaries so the replay into the writer preserves accounting.
    startup: Vec<StartupChunk>,
    startup_len: usize,
    startup_rtp: Option<u32>,
    startup_wall_utc: f64,
    startup_target: usize,

    /// Tail of the previous minute, for the alignment re-check.
    prev_tail: Vec<Complex32>,

    /// Archives that failed to reach disk, retried at each close.
    spool: VecDeque<MinuteArchive>,
}

impl ChannelActor {
    pub fn new(
        shared: Arc<ChannelShared>,
        ts_config: TimeSnapConfig,
        archive_dir: PathBuf,
        ntp: Arc<NtpCache>,
    ) -> Self {
        let config = shared.config.clone();
        let searcher = ToneSearcher::new(config.sample_rate, config.frequency_hz);
        let startup_target = ts_config.buffer_seconds as usize * config.sample_rate as usize;
        Self {
            shared,
            ts_config,
            archive_dir,
            ntp,
            searcher,
            resequencer: Resequencer::new(),
            writer: None,
            tracker: None,
            station: None,
            startup: Vec::new(),
            startup_len: 0,
            startup_rtp: None,
            startup_wall_utc: 0.0,
            startup_target,
            prev_tail: Vec::new(),
            spool: VecDeque::new(),
        }
    }

    /// Spawn the actor thread.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let name = format!("chan-{}", self.shared.config.channel_key());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run(shutdown))
            .expect("failed to spawn channel actor thread")
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!(channel = %self.shared.config.description, "channel actor started");
        self.set_state(ChannelState::Buffering);

        while !shutdown.load(Ordering::Relaxed) {
            let pkt = self.shared.queue.pop_timeout(Duration::from_millis(50));
            let mut events = Vec::new();
            if let Some(pkt) = pkt {
                events.extend(self.resequencer.push(pkt));
            }
            events.extend(self.resequencer.poll(Instant::now()));
            for ev in events {
                self.handle_event(ev);
            }
        }

        // Cooperative shutdown: drain the queue and the reorder window,
        // close the in-progress minute with the remainder zero-filled.
        while let Some(pkt) = self.shared.queue.pop_timeout(Duration::ZERO) {
            let events = self.resequencer.push(pkt);
            for ev in events {
                self.handle_event(ev);
            }
        }
        let events = self.resequencer.flush_all();
        for ev in events {
            self.handle_event(ev);
        }
        let mut closed = Vec::new();
        if let Some(w) = self.writer.as_mut() {
            w.close_partial(&mut closed);
        }
        for archive in closed {
            self.finish_minute(archive);
        }
        info!(channel = %self.shared.config.description, "channel actor stopped");
    }

    fn handle_event(&mut self, ev: SeqEvent) {
        match ev {
            SeqEvent::Samples { rtp, payload } => {
                let samples = decode_iq(&payload);
                if self.writer.is_none() {
                    self.buffer_startup(StartupChunk::Samples { rtp, data: samples });
                } else {
                    let mut closed = Vec::new();
                    if let Some(w) = self.writer.as_mut() {
                        w.handle_samples(rtp, &samples, &mut closed);
                    }
                    for archive in closed {
                        self.finish_minute(archive);
                    }
                    self.refresh_recording_state();
                }
            }
            SeqEvent::Gap {
                rtp_before,
                rtp_after,
                rtp_fill_start,
                missing,
                packets_lost,
            } => {
                self.log_discontinuity(Discontinuity {
                    rtp_before,
                    rtp_after,
                    sample_index: 0,
                    samples_filled: missing,
                    reason: DiscontinuityReason::SeqGap,
                });
                if self.writer.is_none() {
                    self.buffer_startup(StartupChunk::Gap {
                        rtp: rtp_fill_start,
                        missing,
                        packets_lost,
                    });
                } else {
                    let mut closed = Vec::new();
                    if let Some(w) = self.writer.as_mut() {
                        w.handle_gap(rtp_fill_start, missing, packets_lost, &mut closed);
                    }
                    for archive in closed {
                        self.finish_minute(archive);
                    }
                }
            }
            SeqEvent::Restart {
                rtp_before,
                rtp_after,
            } => {
                self.log_discontinuity(Discontinuity {
                    rtp_before,
                    rtp_after,
                    sample_index: 0,
                    samples_filled: 0,
                    reason: DiscontinuityReason::StreamRestart,
                });
                self.on_stream_restart();
            }
        }
    }

    /// Accumulate startup capture; gaps are kept as zero-fill records so
    /// RTP continuity survives into the search buffer and the replay.
    fn buffer_startup(&mut self, chunk: StartupChunk) {
        if self.startup_rtp.is_none() {
            let StartupChunk::Samples { rtp, data } = &chunk else {
                return; // a gap before any sample anchors nothing
            };
            if data.is_empty() {
                return;
            }
            self.startup_rtp = Some(*rtp);
            // Coarse wall clock of the first buffered sample
            let ntp = self.ntp.snapshot();
            self.startup_wall_utc = if ntp.synced {
                ntp.corrected_unix_time()
            } else {
                crate::timing::ntp::system_unix_time()
            };
        }
        self.startup_len += match &chunk {
            StartupChunk::Samples { data, .. } => data.len(),
            StartupChunk::Gap { missing, .. } => *missing as usize,
        };
        self.startup.push(chunk);

        if self.startup_len >= self.startup_target {
            self.establish_anchor();
        }
    }

    /// Contiguous view of the startup capture, gaps as zeros.
    fn flatten_startup(&self) -> Vec<Complex32> {
        let mut out = Vec::with_capacity(self.startup_len);
        for chunk in &self.startup {
            match chunk {
                StartupChunk::Samples { data, .. } => out.extend_from_slice(data),
                StartupChunk::Gap { missing, .. } => {
                    out.extend(std::iter::repeat(Complex32::new(0.0, 0.0)).take(*missing as usize))
                }
            }
        }
        out
    }

    /// Buffer full: search for the minute tone, fall back to NTP, then wall.
    fn establish_anchor(&mut self) {
        let start_rtp = match self.startup_rtp {
            Some(r) => r,
            None => return,
        };
        let sr = self.shared.config.sample_rate;

        let result = if self.searcher.usable() {
            let contiguous = self.flatten_startup();
            self.searcher
                .search(&contiguous, start_rtp, self.startup_wall_utc)
        } else {
            None
        };

        let anchor = match result {
            Some(res) => {
                info!(
                    channel = %self.shared.config.description,
                    station = res.station.name(),
                    snr_db = res.snr_db,
                    confidence = res.anchor.confidence,
                    "time-snap from minute tone"
                );
                self.station = Some(res.station);
                res.anchor
            }
            None => {
                let rtp_now = start_rtp.wrapping_add(self.startup_len as u32);
                let ntp = self.ntp.snapshot();
                let anchor = fallback_anchor(rtp_now, &ntp, sr);
                warn!(
                    channel = %self.shared.config.description,
                    error = %RecorderError::Degraded(format!(
                        "no minute tone found, anchoring from {}",
                        anchor.source.as_str()
                    )),
                    confidence = anchor.confidence,
                    "falling back"
                );
                anchor
            }
        };

        self.install_anchor(anchor);
        if let (Some(res), Some(w)) = (&result, self.writer.as_mut()) {
            w.set_tone_powers(res.powers);
        }

        // Replay the buffered capture chunk by chunk so the minute
        // containing the buffer is not lost and packet accounting holds.
        let startup = std::mem::take(&mut self.startup);
        let mut closed = Vec::new();
        if let Some(w) = self.writer.as_mut() {
            for chunk in startup {
                match chunk {
                    StartupChunk::Samples { rtp, data } => {
                        w.handle_samples(rtp, &data, &mut closed)
                    }
                    StartupChunk::Gap {
                        rtp,
                        missing,
                        packets_lost,
                    } => w.handle_gap(rtp, missing, packets_lost, &mut closed),
                }
            }
        }
        for archive in closed {
            self.finish_minute(archive);
        }
        self.startup_len = 0;
        self.startup_rtp = None;
        self.set_state(ChannelState::Armed);
        self.refresh_recording_state();
    }

    fn install_anchor(&mut self, anchor: TimeSnap) {
        {
            let mut s = self.shared.status.lock();
            s.time_snap_source = Some(anchor.source.as_str().to_string());
            s.time_snap_confidence = Some(anchor.confidence);
        }
        if let (Some(tracker), Some(writer)) = (self.tracker.as_mut(), self.writer.as_mut()) {
            tracker.reestablish(anchor);
            writer.reset_anchor(anchor);
            return;
        }
        self.tracker = Some(AnchorTracker::new(anchor, self.ts_config.clone()));
        self.writer = Some(MinuteWriter::new(
            self.shared.config.clone(),
            self.ntp.clone(),
            anchor,
        ));
    }

    fn on_stream_restart(&mut self) {
        {
            let mut s = self.shared.status.lock();
            s.restarts += 1;
        }
        let mut closed = Vec::new();
        if let Some(w) = self.writer.as_mut() {
            w.close_partial(&mut closed);
        }
        for archive in closed {
            self.finish_minute(archive);
        }
        // Drop the writer: a restarted stream has a new RTP origin, so the
        // old anchor is meaningless until a new tone is found.
        self.writer = None;
        self.resequencer.reset();
        self.startup.clear();
        self.startup_len = 0;
        self.startup_rtp = None;
        self.prev_tail.clear();
        self.set_state(ChannelState::Buffering);
    }

    /// Post-process and persist one closed minute.
    fn finish_minute(&mut self, archive: MinuteArchive) {
        self.check_alignment(&archive);
        self.retain_tail(&archive);

        {
            let mut s = self.shared.status.lock();
            s.minutes_written += 1;
            s.last_minute_utc = Some(archive.unix_timestamp);
            s.gaps += archive.gaps_count as u64;
        }

        // Retry anything spooled from earlier failures first
        while let Some(spooled) = self.spool.pop_front() {
            if !self.write_archive(&spooled) {
                self.spool.push_front(spooled);
                break;
            }
        }

        if !self.write_archive(&archive) {
            if self.spool.len() >= SPOOL_CAPACITY {
                self.spool.pop_front();
                warn!("archive spool overflow, oldest record dropped");
            }
            self.spool.push_back(archive);
        }
        self.shared.status.lock().spooled = self.spool.len();
    }

    fn write_archive(&self, archive: &MinuteArchive) -> bool {
        let path = self
            .archive_dir
            .join(format!("{}.npz", archive.file_stem()));
        let members = archive.to_npz_members();
        for attempt in 0..WRITE_RETRIES {
            match npz::write_npz(&path, &members) {
                Ok(()) => {
                    debug!(path = %path.display(), "archive written");
                    return true;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "archive write failed"
                    );
                    std::thread::sleep(WRITE_BACKOFF * (attempt + 1));
                }
            }
        }
        self.shared.status.lock().write_failures += 1;
        error!(path = %path.display(), "archive write abandoned, spooling");
        false
    }

    /// Re-measure the minute tone at the top of the closed minute and offer
    /// the tracker a corrected anchor.
    fn check_alignment(&mut self, archive: &MinuteArchive) {
        let station = match self.station {
            Some(s) if self.searcher.usable() => s,
            _ => return,
        };
        let sr = archive.sample_rate as usize;
        let head = ALIGNMENT_HEAD_SECS * sr;
        if archive.iq.len() < head {
            return;
        }

        // Window: tail of the previous minute + head of this one, so edges
        // slightly before the boundary are visible too.
        let mut window: Vec<Complex32> =
            Vec::with_capacity(self.prev_tail.len() + head);
        window.extend_from_slice(&self.prev_tail);
        window.extend_from_slice(&archive.iq[..head]);
        let expected_edge = self.prev_tail.len() as f64;

        let mut env = envelope(&window);
        remove_dc(&mut env);
        let det = match self.searcher.measure_alignment(&env, station) {
            Some(d) => d,
            None => return,
        };

        let error_samples = det.index - expected_edge;
        let candidate = TimeSnap {
            rtp_anchor: archive
                .rtp_timestamp
                .wrapping_add(error_samples.round() as i64 as u32),
            utc_anchor: archive.unix_timestamp,
            source: self.tracker.as_ref().map(|t| t.anchor().source).unwrap_or(
                crate::timing::time_snap::TimeSnapSource::Wall,
            ),
            confidence: confidence_from_snr(det.snr_db),
            sample_rate: archive.sample_rate,
        };

        let applied = self
            .tracker
            .as_mut()
            .and_then(|t| t.offer(candidate, Instant::now()));
        if let Some(corr) = applied {
            self.shared.status.lock().corrections += 1;
            if let Some(w) = self.writer.as_mut() {
                w.update_anchor(candidate);
            }
            self.log_discontinuity(Discontinuity {
                rtp_before: archive.rtp_timestamp,
                rtp_after: candidate.rtp_anchor,
                sample_index: 0,
                samples_filled: 0,
                reason: DiscontinuityReason::TimeSnapCorrection,
            });
            info!(
                channel = %self.shared.config.description,
                error_ms = corr.error_ms,
                rtp_at = corr.rtp_at,
                "anchor corrected from minute tone"
            );
        }
    }

    fn retain_tail(&mut self, archive: &MinuteArchive) {
        let sr = archive.sample_rate as usize;
        let tail = ALIGNMENT_TAIL_SECS * sr;
        if archive.iq.len() >= tail {
            self.prev_tail = archive.iq[archive.iq.len() - tail..].to_vec();
        }
    }

    fn refresh_recording_state(&mut self) {
        let recording = self
            .writer
            .as_ref()
            .map(|w| w.is_open())
            .unwrap_or(false);
        if recording {
            self.set_state(ChannelState::Recording);
        }
    }

    fn log_discontinuity(&self, d: Discontinuity) {
        let err = match d.reason {
            DiscontinuityReason::SeqGap => RecorderError::DataLoss {
                rtp: d.rtp_after,
                missing: d.samples_filled,
            },
            DiscontinuityReason::StreamRestart => RecorderError::StreamRestart {
                rtp_before: d.rtp_before,
                rtp_after: d.rtp_after,
            },
            DiscontinuityReason::TimeSnapCorrection => {
                debug!(
                    channel = %self.shared.config.description,
                    rtp_before = d.rtp_before,
                    rtp_after = d.rtp_after,
                    "anchor moved"
                );
                return;
            }
        };
        debug!(
            channel = %self.shared.config.description,
            reason = d.reason.as_str(),
            error = %err,
            "discontinuity"
        );
    }

    fn set_state(&self, state: ChannelState) {
        self.shared.status.lock().state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raw(seq: u16, rtp: u32, n_samples: usize) -> RawPacket {
        RawPacket {
            seq,
            rtp,
            payload: Bytes::from(vec![0u8; n_samples * 4]),
            arrived: Instant::now(),
        }
    }

    const SR: u32 = 8000;
    const SPP: usize = 400; // 50 ms per packet

    fn encode_payload(samples: &[Complex32]) -> Bytes {
        let mut b = Vec::with_capacity(samples.len() * 4);
        for z in samples {
            let q = (z.im * 32767.0).clamp(-32768.0, 32767.0) as i16;
            let i = (z.re * 32767.0).clamp(-32768.0, 32767.0) as i16;
            b.extend_from_slice(&q.to_be_bytes());
            b.extend_from_slice(&i.to_be_bytes());
        }
        Bytes::from(b)
    }

    /// AM sample stream: carrier with a 1000 Hz tone burst over
    /// `[tone_start, tone_start + 0.8)` seconds of stream time.
    fn stream_sample(i: usize, tone_start: f64) -> Complex32 {
        let t = i as f64 / SR as f64;
        let am = if t >= tone_start && t < tone_start + 0.8 {
            0.5 + 0.4 * (2.0 * std::f64::consts::PI * 1000.0 * (t - tone_start)).sin()
        } else {
            0.5
        };
        Complex32::new(am as f32, 0.0)
    }

    fn make_actor(buffer_seconds: u32) -> (ChannelActor, Arc<ChannelShared>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(ChannelShared::new(ChannelConfig {
            ssrc: 5_000_000,
            frequency_hz: 10e6,
            sample_rate: SR,
            description: "WWV 10 MHz".into(),
        }));
        let ts = TimeSnapConfig {
            buffer_seconds,
            correction_threshold_ms: 50.0,
            min_interval_s: 600,
        };
        let actor = ChannelActor::new(
            shared.clone(),
            ts,
            dir.path().to_path_buf(),
            Arc::new(NtpCache::new()),
        );
        (actor, shared, dir)
    }

    /// Feed packets `[from, to)` of the synthetic stream, skipping any
    /// packet index in `drop`.
    fn feed(actor: &mut ChannelActor, from: usize, to: usize, tone_start: f64, drop: &[usize]) {
        for p in from..to {
            if drop.contains(&p) {
                continue;
            }
            let samples: Vec<Complex32> = (0..SPP)
                .map(|k| stream_sample(p * SPP + k, tone_start))
                .collect();
            let pkt = RawPacket {
                seq: (p % 65536) as u16,
                rtp: (p * SPP) as u32,
                payload: encode_payload(&samples),
                arrived: Instant::now(),
            };
            let events = actor.resequencer.push(pkt);
            for ev in events {
                actor.handle_event(ev);
            }
        }
        let events = actor.resequencer.flush_all();
        for ev in events {
            actor.handle_event(ev);
        }
    }

    #[test]
    fn test_clean_capture_end_to_end() {
        // 10 s tone-search buffer, tone at stream second 5, then enough
        // stream to complete the minute containing the tone.
        let (mut actor, shared, dir) = make_actor(10);
        let packets_per_sec = SR as usize / SPP;
        feed(&mut actor, 0, 70 * packets_per_sec, 5.0, &[]);

        let status = shared.status();
        assert_eq!(status.state, ChannelState::Recording);
        assert_eq!(status.time_snap_source.as_deref(), Some("wwv"));
        assert!(status.time_snap_confidence.unwrap() >= 0.9);
        assert!(status.minutes_written >= 1);
        assert_eq!(status.gaps, 0);

        // Archives landed on disk as npz
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|x| x == "npz")
                    .unwrap_or(false)
            })
            .collect();
        assert!(!files.is_empty());
        let members = npz::read_npz(&files[0].path()).unwrap();
        match &members["iq"] {
            npz::NpyValue::C64(v) => assert_eq!(v.len(), SR as usize * 60),
            other => panic!("unexpected iq {:?}", other),
        }
        assert_eq!(members["time_snap_source"].as_str(), Some("wwv"));
        assert_eq!(members["gaps_count"].as_u32_scalar(), Some(0));
    }

    #[test]
    fn test_single_drop_end_to_end() {
        let (mut actor, shared, dir) = make_actor(10);
        let packets_per_sec = SR as usize / SPP;
        // Drop one packet well after the anchor minute starts
        let drop = [30 * packets_per_sec + 3];
        feed(&mut actor, 0, 80 * packets_per_sec, 5.0, &drop);

        let status = shared.status();
        assert_eq!(status.gaps, 1);

        // Find the archive carrying the gap and check the filled range
        let mut found = false;
        for entry in std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()) {
            if entry.path().extension().map(|x| x != "npz").unwrap_or(true) {
                continue;
            }
            let members = npz::read_npz(&entry.path()).unwrap();
            if members["gaps_count"].as_u32_scalar() == Some(1) {
                found = true;
                assert_eq!(members["gaps_filled"].as_u32_scalar(), Some(SPP as u32));
                let (idx, filled, iq) = match (
                    &members["gap_sample_indices"],
                    &members["gap_samples_filled"],
                    &members["iq"],
                ) {
                    (npz::NpyValue::U32(i), npz::NpyValue::U32(f), npz::NpyValue::C64(q)) => {
                        (i.clone(), f.clone(), q.clone())
                    }
                    _ => panic!("bad gap arrays"),
                };
                assert_eq!(idx.len(), 1);
                assert_eq!(filled, vec![SPP as u32]);
                let lo = idx[0] as usize;
                assert!(iq[lo..lo + SPP].iter().all(|z| z.re == 0.0 && z.im == 0.0));
            }
        }
        assert!(found, "no archive carried the gap");
    }

    #[test]
    fn test_stream_restart_end_to_end() {
        let (mut actor, shared, _dir) = make_actor(10);
        let packets_per_sec = SR as usize / SPP;
        feed(&mut actor, 0, 70 * packets_per_sec, 5.0, &[]);
        assert_eq!(shared.status().state, ChannelState::Recording);
        let minutes_before = shared.status().minutes_written;

        // Consecutive seq with an RTP leap far beyond tolerance
        let p = 70 * packets_per_sec;
        let pkt = RawPacket {
            seq: (p % 65536) as u16,
            rtp: (p * SPP) as u32 + 20 * SR,
            payload: encode_payload(&vec![Complex32::new(0.5, 0.0); SPP]),
            arrived: Instant::now(),
        };
        let events = actor.resequencer.push(pkt);
        for ev in events {
            actor.handle_event(ev);
        }

        let status = shared.status();
        assert_eq!(status.restarts, 1);
        // The partial minute in progress was closed on the way down
        assert!(status.minutes_written > minutes_before);
        // Back to tone buffering until a new anchor is found
        assert_eq!(status.state, ChannelState::Buffering);
    }

    #[test]
    fn test_queue_drops_oldest() {
        let q = PacketQueue::new(2);
        q.push(raw(0, 0, 8));
        q.push(raw(1, 8, 8));
        q.push(raw(2, 16, 8));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.len(), 2);
        let first = q.pop_timeout(Duration::ZERO).unwrap();
        assert_eq!(first.seq, 1);
    }

    #[test]
    fn test_queue_pop_timeout_empty() {
        let q = PacketQueue::new(4);
        let start = Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_shared_status_snapshot() {
        let shared = ChannelShared::new(ChannelConfig {
            ssrc: 42,
            frequency_hz: 10e6,
            sample_rate: 16000,
            description: "WWV 10 MHz".into(),
        });
        let st = shared.status();
        assert_eq!(st.ssrc, 42);
        assert_eq!(st.state, ChannelState::Init);
        assert_eq!(st.minutes_written, 0);
    }
}
