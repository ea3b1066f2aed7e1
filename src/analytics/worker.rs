//! Per-channel analytics worker.
//!
//! Consumes minute archives discovered by the watcher, derives the 10 Hz
//! decimated product, runs the discrimination methods, fuses them through
//! the voting combiner and appends the daily CSV row. Any subset of
//! methods may fail or be inapplicable on a given channel; the combiner
//! tolerates missing inputs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::analytics::bcd::{BcdCorrelator, BcdResult};
use crate::analytics::discrimination::{DiscriminationRecord, DiscriminationWriter};
use crate::analytics::ticks::{TickAnalyzer, TickResult};
use crate::analytics::tone_metrics::{ToneAnalyzer, ToneMetrics};
use crate::analytics::voting::{MethodInputs, VoteOutcome, VotingCombiner};
use crate::analytics::watcher::ArchiveWatcher;
use crate::capture::archive::MinuteArchive;
use crate::capture::npz::{self, NpyValue};
use crate::config::{ChannelConfig, RecorderConfig};
use crate::dsp::decimate::Decimator;
use crate::station::ToaModel;

/// Archive directory poll interval.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Decimated product output rate.
const DECIMATED_RATE: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsStatus {
    pub channel: String,
    pub minutes_processed: u64,
    pub last_record_id: Option<String>,
    pub last_minute_utc: Option<f64>,
    pub csv_rows_written: u64,
    pub errors: u64,
}

#[derive(Default)]
struct StatusInner {
    minutes_processed: u64,
    last_record_id: Option<String>,
    last_minute_utc: Option<f64>,
    csv_rows_written: u64,
    errors: u64,
}

pub struct AnalyticsShared {
    channel: String,
    inner: Mutex<StatusInner>,
}

impl AnalyticsShared {
    pub fn new(channel: String) -> Self {
        Self {
            channel,
            inner: Mutex::new(StatusInner::default()),
        }
    }

    pub fn status(&self) -> AnalyticsStatus {
        let s = self.inner.lock();
        AnalyticsStatus {
            channel: self.channel.clone(),
            minutes_processed: s.minutes_processed,
            last_record_id: s.last_record_id.clone(),
            last_minute_utc: s.last_minute_utc,
            csv_rows_written: s.csv_rows_written,
            errors: s.errors,
        }
    }
}

pub struct AnalyticsWorker {
    channel: ChannelConfig,
    watcher: ArchiveWatcher,
    decimated_dir: PathBuf,
    decimator: Option<Decimator>,
    tones: ToneAnalyzer,
    bcd: BcdCorrelator,
    ticks: TickAnalyzer,
    combiner: VotingCombiner,
    csv: DiscriminationWriter,
    shared: Arc<AnalyticsShared>,
}

impl AnalyticsWorker {
    pub fn new(
        config: &RecorderConfig,
        channel: ChannelConfig,
        shared: Arc<AnalyticsShared>,
    ) -> Self {
        let watcher = ArchiveWatcher::new(
            config.archive_dir(&channel),
            config.analytics_state_path(&channel),
        );
        let decimator = match Decimator::new(channel.sample_rate, DECIMATED_RATE) {
            Ok(d) => {
                debug!(
                    channel = %channel.description,
                    ratio = d.ratio(),
                    "decimator planned"
                );
                Some(d)
            }
            Err(e) => {
                warn!(
                    channel = %channel.description,
                    error = %e,
                    "decimation disabled for this channel"
                );
                None
            }
        };
        let toa = config
            .station
            .grid_square
            .as_deref()
            .and_then(ToaModel::from_grid_square);
        Self {
            watcher,
            decimated_dir: config.decimated_dir(&channel),
            decimator,
            tones: ToneAnalyzer::new(channel.sample_rate),
            bcd: BcdCorrelator::new(config.bcd.clone(), toa),
            ticks: TickAnalyzer::new(channel.sample_rate),
            combiner: VotingCombiner::new(config.voting.clone()),
            csv: DiscriminationWriter::new(
                config.discrimination_dir(&channel),
                channel.channel_key(),
            ),
            channel,
            shared,
        }
    }

    /// Spawn the worker thread.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let name = format!("analytics-{}", self.channel.channel_key());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run(shutdown))
            .expect("failed to spawn analytics worker thread")
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!(channel = %self.channel.description, "analytics worker started");
        while !shutdown.load(Ordering::Relaxed) {
            let files = self.watcher.poll();
            for path in files {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match self.process_file(&path) {
                    Ok(()) => {
                        if let Err(e) = self.watcher.mark_processed(&path) {
                            warn!(error = %e, "could not persist watcher state");
                        }
                    }
                    Err(e) => {
                        self.shared.inner.lock().errors += 1;
                        error!(
                            path = %path.display(),
                            error = %e,
                            "minute analysis failed"
                        );
                        // Mark anyway: a corrupt file will never improve
                        let _ = self.watcher.mark_processed(&path);
                    }
                }
            }
            // Shutdown-aware poll sleep
            let mut slept = Duration::ZERO;
            while slept < POLL_INTERVAL && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
                slept += Duration::from_millis(200);
            }
        }
        info!(channel = %self.channel.description, "analytics worker stopped");
    }

    /// Full pipeline for one minute archive.
    pub fn process_file(&mut self, path: &Path) -> Result<()> {
        let members = npz::read_npz(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let archive = MinuteArchive::from_npz_members(&members)
            .with_context(|| format!("decoding {}", path.display()))?;

        let expected = archive.sample_rate as usize * 60;
        if archive.iq.len() != expected {
            anyhow::bail!(
                "archive has {} samples, expected {}",
                archive.iq.len(),
                expected
            );
        }

        self.write_decimated(&archive)?;

        let tones = self.tones.analyze(&archive);
        let bcd = self.bcd.analyze(&archive);
        let ticks = self.ticks.analyze(&archive);

        let inputs = method_inputs(&tones, &bcd, &ticks);
        let outcome = self.combiner.combine(archive.minute_number(), &inputs);

        let record = build_record(&archive, &tones, &bcd, &ticks, &outcome);
        self.csv.write(&record)?;

        let mut s = self.shared.inner.lock();
        s.minutes_processed += 1;
        s.csv_rows_written += 1;
        s.last_minute_utc = Some(archive.unix_timestamp);
        s.last_record_id = path
            .file_stem()
            .and_then(|x| x.to_str())
            .map(|x| x.to_string());
        drop(s);

        debug!(
            channel = %self.channel.description,
            minute = archive.unix_timestamp,
            dominant = outcome.dominant.as_str(),
            confidence = outcome.confidence,
            "minute analyzed"
        );
        Ok(())
    }

    /// Derive and store the 10 Hz product with the inherited anchor
    /// snapshot.
    fn write_decimated(&self, archive: &MinuteArchive) -> Result<()> {
        let Some(decimator) = &self.decimator else {
            return Ok(());
        };
        let iq10 = decimator.process(&archive.iq);

        let members = vec![
            ("iq".to_string(), NpyValue::C64(iq10)),
            (
                "rtp_timestamp".to_string(),
                NpyValue::U32(vec![archive.rtp_timestamp]),
            ),
            ("rtp_ssrc".to_string(), NpyValue::U32(vec![archive.rtp_ssrc])),
            (
                "sample_rate".to_string(),
                NpyValue::U32(vec![DECIMATED_RATE]),
            ),
            (
                "source_sample_rate".to_string(),
                NpyValue::U32(vec![archive.sample_rate]),
            ),
            (
                "frequency_hz".to_string(),
                NpyValue::F64(vec![archive.frequency_hz]),
            ),
            (
                "channel_name".to_string(),
                NpyValue::Str(archive.channel_name.clone()),
            ),
            (
                "unix_timestamp".to_string(),
                NpyValue::F64(vec![archive.unix_timestamp]),
            ),
            (
                "time_snap_rtp".to_string(),
                NpyValue::U32(vec![archive.time_snap_rtp]),
            ),
            (
                "time_snap_utc".to_string(),
                NpyValue::F64(vec![archive.time_snap_utc]),
            ),
            (
                "time_snap_source".to_string(),
                NpyValue::Str(archive.time_snap_source.clone()),
            ),
            (
                "time_snap_confidence".to_string(),
                NpyValue::F64(vec![archive.time_snap_confidence]),
            ),
            (
                "time_snap_station".to_string(),
                NpyValue::Str(archive.time_snap_station.clone()),
            ),
        ];

        let path = self
            .decimated_dir
            .join(format!("{}_10hz.npz", archive.file_stem()));
        npz::write_npz(&path, &members)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Reduce method results to combiner inputs.
fn method_inputs(
    tones: &Option<ToneMetrics>,
    bcd: &Option<BcdResult>,
    ticks: &Option<TickResult>,
) -> MethodInputs {
    let mut inputs = MethodInputs::default();

    if let Some(t) = tones {
        if let (Some(wwv), Some(wwvh)) = (t.wwv, t.wwvh) {
            inputs.tone_powers_db = Some((wwv.power_db, wwvh.power_db));
        }
        inputs.tone_440 = Some((
            t.tone_440_wwv.detected,
            t.tone_440_wwv.power_db,
            t.tone_440_wwvh.detected,
            t.tone_440_wwvh.power_db,
        ));
    }
    if let Some(b) = bcd {
        inputs.bcd_amplitudes = Some((b.wwv_amplitude, b.wwvh_amplitude));
    }
    if let Some(t) = ticks {
        inputs.tick_snrs_db = Some((t.wwv_snr_db, t.wwvh_snr_db));
    }
    inputs
}

/// Flatten everything into the CSV row.
fn build_record(
    archive: &MinuteArchive,
    tones: &Option<ToneMetrics>,
    bcd: &Option<BcdResult>,
    ticks: &Option<TickResult>,
    outcome: &VoteOutcome,
) -> DiscriminationRecord {
    let wwv = tones.as_ref().and_then(|t| t.wwv);
    let wwvh = tones.as_ref().and_then(|t| t.wwvh);

    let wwv_power = wwv.map(|m| m.power_db).unwrap_or(f64::NEG_INFINITY);
    let wwvh_power = wwvh.map(|m| m.power_db).unwrap_or(f64::NEG_INFINITY);
    let power_ratio = if wwv_power.is_finite() && wwvh_power.is_finite() {
        wwv_power - wwvh_power
    } else {
        f64::NEG_INFINITY
    };
    let differential_delay_ms = match (wwv, wwvh) {
        (Some(a), Some(b)) if a.detected && b.detected => {
            b.timing_error_ms - a.timing_error_ms
        }
        _ => 0.0,
    };

    DiscriminationRecord {
        minute_timestamp: archive.unix_timestamp.floor() as i64,
        minute_number: archive.minute_number(),
        wwv_detected: wwv.map(|m| m.detected).unwrap_or(false),
        wwvh_detected: wwvh.map(|m| m.detected).unwrap_or(false),
        wwv_power_db: wwv_power,
        wwvh_power_db: wwvh_power,
        power_ratio_db: power_ratio,
        differential_delay_ms,
        tone_440hz_wwv_detected: tones
            .as_ref()
            .map(|t| t.tone_440_wwv.detected)
            .unwrap_or(false),
        tone_440hz_wwv_power_db: tones
            .as_ref()
            .map(|t| t.tone_440_wwv.power_db)
            .unwrap_or(f64::NEG_INFINITY),
        tone_440hz_wwvh_detected: tones
            .as_ref()
            .map(|t| t.tone_440_wwvh.detected)
            .unwrap_or(false),
        tone_440hz_wwvh_power_db: tones
            .as_ref()
            .map(|t| t.tone_440_wwvh.power_db)
            .unwrap_or(f64::NEG_INFINITY),
        dominant_station: outcome.dominant.as_str().to_string(),
        confidence: outcome.confidence_tag.to_string(),
        tick_windows: ticks.as_ref().map(|t| t.windows.clone()).unwrap_or_default(),
        bcd_wwv_amplitude: bcd.as_ref().map(|b| b.wwv_amplitude).unwrap_or(0.0),
        bcd_wwvh_amplitude: bcd.as_ref().map(|b| b.wwvh_amplitude).unwrap_or(0.0),
        bcd_differential_delay_ms: bcd
            .as_ref()
            .map(|b| b.differential_delay_ms)
            .unwrap_or(0.0),
        bcd_correlation_quality: bcd
            .as_ref()
            .map(|b| b.correlation_quality)
            .unwrap_or(0.0),
        bcd_windows: bcd.as_ref().map(|b| b.windows.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::archive::TONE_POWER_SENTINEL;
    use num_complex::Complex32;

    fn test_config(root: &Path) -> RecorderConfig {
        let toml_src = format!(
            r#"
mode = "production"
data_root = "{}"

[[channels]]
ssrc = 5000000
frequency_hz = 10000000.0
sample_rate = 8000
description = "WWV 10 MHz"

[multicast]
group = "239.1.2.3"
"#,
            root.display()
        );
        toml::from_str(&toml_src).unwrap()
    }

    fn synth_archive(minute_utc: f64) -> MinuteArchive {
        let sr = 8000u32;
        let n = sr as usize * 60;
        // Carrier with the WWV minute tone at :00
        let iq: Vec<Complex32> = (0..n)
            .map(|i| {
                let t = i as f64 / sr as f64;
                let am = if t < 0.8 {
                    1.0 + 0.8 * (2.0 * std::f64::consts::PI * 1000.0 * t).sin()
                } else {
                    1.0
                };
                Complex32::new(am as f32, 0.0)
            })
            .collect();
        MinuteArchive {
            iq,
            rtp_timestamp: 960_000,
            rtp_ssrc: 5_000_000,
            sample_rate: sr,
            frequency_hz: 10e6,
            channel_name: "WWV 10 MHz".into(),
            unix_timestamp: minute_utc,
            time_snap_rtp: 0,
            time_snap_utc: minute_utc,
            time_snap_source: "wwv".into(),
            time_snap_confidence: 0.95,
            time_snap_station: "WWV".into(),
            tone_power_1000_hz_db: -10.0,
            tone_power_1200_hz_db: TONE_POWER_SENTINEL,
            wwvh_differential_delay_ms: 0.0,
            ntp_wall_clock_time: minute_utc + 0.01,
            ntp_offset_ms: 0.5,
            gaps_count: 0,
            gaps_filled: 0,
            packets_received: 1500,
            packets_expected: 1500,
            gap_rtp_timestamps: vec![],
            gap_sample_indices: vec![],
            gap_samples_filled: vec![],
            gap_packets_lost: vec![],
            recorder_version: "test".into(),
            created_timestamp: minute_utc + 60.5,
        }
    }

    #[test]
    fn test_end_to_end_minute_processing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();

        // Drop a synthetic archive where the watcher looks
        let archive = synth_archive(1_700_000_040.0);
        let archive_path = config
            .archive_dir(&channel)
            .join(format!("{}.npz", archive.file_stem()));
        npz::write_npz(&archive_path, &archive.to_npz_members()).unwrap();

        let shared = Arc::new(AnalyticsShared::new(channel.description.clone()));
        let mut worker = AnalyticsWorker::new(&config, channel.clone(), shared.clone());

        let files = worker.watcher.poll();
        assert_eq!(files.len(), 1);
        worker.process_file(&files[0]).unwrap();
        worker.watcher.mark_processed(&files[0]).unwrap();

        // Decimated product exists with 600 samples
        let dec_path = config
            .decimated_dir(&channel)
            .join(format!("{}_10hz.npz", archive.file_stem()));
        let dec = npz::read_npz(&dec_path).unwrap();
        match &dec["iq"] {
            NpyValue::C64(v) => assert_eq!(v.len(), 600),
            other => panic!("unexpected iq dtype {:?}", other),
        }
        assert_eq!(dec["sample_rate"].as_u32_scalar(), Some(10));
        assert_eq!(dec["time_snap_source"].as_str(), Some("wwv"));

        // CSV row exists and names WWV as detected
        let csv_path = config
            .discrimination_dir(&channel)
            .join("WWV_10_MHz_discrimination_20231114.csv");
        let content = std::fs::read_to_string(&csv_path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert!(row.starts_with("2023-11-14T22:14:00Z,1700000040,14,true,"));

        let status = shared.status();
        assert_eq!(status.minutes_processed, 1);
        assert_eq!(status.csv_rows_written, 1);
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();

        let archive = synth_archive(1_700_000_040.0);
        let archive_path = config
            .archive_dir(&channel)
            .join(format!("{}.npz", archive.file_stem()));
        npz::write_npz(&archive_path, &archive.to_npz_members()).unwrap();

        let shared = Arc::new(AnalyticsShared::new(channel.description.clone()));
        let mut worker = AnalyticsWorker::new(&config, channel.clone(), shared);

        worker.process_file(&archive_path).unwrap();
        worker.process_file(&archive_path).unwrap();

        let csv_path = config
            .discrimination_dir(&channel)
            .join("WWV_10_MHz_discrimination_20231114.csv");
        let content = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(content.lines().count(), 2); // header + one row
    }

    #[test]
    fn test_rejects_short_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let channel = config.channels[0].clone();

        let mut archive = synth_archive(1_700_000_040.0);
        archive.iq.truncate(100);
        let path = dir.path().join("bad.npz");
        npz::write_npz(&path, &archive.to_npz_members()).unwrap();

        let shared = Arc::new(AnalyticsShared::new("x".into()));
        let mut worker = AnalyticsWorker::new(&config, channel, shared);
        assert!(worker.process_file(&path).is_err());
    }
}
