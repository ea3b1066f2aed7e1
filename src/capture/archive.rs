//! Minute archive records.
//!
//! A minute archive is self-contained: exactly `sample_rate * 60` gap-filled
//! complex samples plus everything a consumer needs to interpret them. No
//! later consumer needs state from any other file.
//!
//! Two time references are stored on purpose: `unix_timestamp` is the ADC
//! clock reading (derived from the RTP anchor), `ntp_wall_clock_time` is an
//! independent reference captured at minute close. Their difference measures
//! ADC-vs-NTP drift; deriving one from the other would make that difference
//! identically zero and is forbidden.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use num_complex::Complex32;

use crate::capture::npz::NpyValue;
use crate::error::RecorderError;

/// Sentinel for tone powers when no tone was detected.
pub const TONE_POWER_SENTINEL: f64 = -999.0;

/// Why samples were zero-filled or an anchor moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscontinuityReason {
    SeqGap,
    StreamRestart,
    TimeSnapCorrection,
}

impl DiscontinuityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscontinuityReason::SeqGap => "seq_gap",
            DiscontinuityReason::StreamRestart => "stream_restart",
            DiscontinuityReason::TimeSnapCorrection => "time_snap_correction",
        }
    }
}

/// One discontinuity, immutable once created.
#[derive(Debug, Clone, Copy)]
pub struct Discontinuity {
    pub rtp_before: u32,
    pub rtp_after: u32,
    pub sample_index: u32,
    pub samples_filled: u32,
    pub reason: DiscontinuityReason,
}

/// One complete, gap-filled minute of I/Q with embedded timing metadata.
#[derive(Debug, Clone)]
pub struct MinuteArchive {
    /// Exactly `sample_rate * 60` complex samples, zero where filled.
    pub iq: Vec<Complex32>,
    /// RTP timestamp of sample 0.
    pub rtp_timestamp: u32,
    pub rtp_ssrc: u32,
    pub sample_rate: u32,
    pub frequency_hz: f64,
    pub channel_name: String,
    /// UTC of sample 0, derived from the RTP anchor (the ADC clock reading).
    pub unix_timestamp: f64,
    pub time_snap_rtp: u32,
    pub time_snap_utc: f64,
    pub time_snap_source: String,
    pub time_snap_confidence: f64,
    pub time_snap_station: String,
    pub tone_power_1000_hz_db: f64,
    pub tone_power_1200_hz_db: f64,
    pub wwvh_differential_delay_ms: f64,
    /// Independent wall-clock reference captured at minute close.
    pub ntp_wall_clock_time: f64,
    pub ntp_offset_ms: f64,
    pub gaps_count: u32,
    pub gaps_filled: u32,
    pub packets_received: u32,
    pub packets_expected: u32,
    pub gap_rtp_timestamps: Vec<u32>,
    pub gap_sample_indices: Vec<u32>,
    pub gap_samples_filled: Vec<u32>,
    pub gap_packets_lost: Vec<u32>,
    pub recorder_version: String,
    pub created_timestamp: f64,
}

impl MinuteArchive {
    /// Fraction of the minute carried by real samples, as a percentage.
    pub fn completeness_pct(&self) -> f64 {
        let total = self.iq.len() as f64;
        if total == 0.0 {
            return 0.0;
        }
        (1.0 - self.gaps_filled as f64 / total) * 100.0
    }

    /// UTC datetime of sample 0.
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(
            self.unix_timestamp.floor() as i64,
            0,
        )
    }

    /// Minute of the hour (0-59) of sample 0.
    pub fn minute_number(&self) -> u32 {
        self.start_datetime().map(|dt| dt.minute()).unwrap_or(0)
    }

    /// File stem: `YYYYMMDDTHHMMSSZ_{FREQ}_iq`.
    pub fn file_stem(&self) -> String {
        let dt = self
            .start_datetime()
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        format!(
            "{}_{}_iq",
            dt.format("%Y%m%dT%H%M%SZ"),
            self.frequency_hz as u64
        )
    }

    /// NPZ member list, in stable order.
    pub fn to_npz_members(&self) -> Vec<(String, NpyValue)> {
        vec![
            ("iq".into(), NpyValue::C64(self.iq.clone())),
            ("rtp_timestamp".into(), NpyValue::U32(vec![self.rtp_timestamp])),
            ("rtp_ssrc".into(), NpyValue::U32(vec![self.rtp_ssrc])),
            ("sample_rate".into(), NpyValue::U32(vec![self.sample_rate])),
            ("frequency_hz".into(), NpyValue::F64(vec![self.frequency_hz])),
            ("channel_name".into(), NpyValue::Str(self.channel_name.clone())),
            ("unix_timestamp".into(), NpyValue::F64(vec![self.unix_timestamp])),
            ("time_snap_rtp".into(), NpyValue::U32(vec![self.time_snap_rtp])),
            ("time_snap_utc".into(), NpyValue::F64(vec![self.time_snap_utc])),
            (
                "time_snap_source".into(),
                NpyValue::Str(self.time_snap_source.clone()),
            ),
            (
                "time_snap_confidence".into(),
                NpyValue::F64(vec![self.time_snap_confidence]),
            ),
            (
                "time_snap_station".into(),
                NpyValue::Str(self.time_snap_station.clone()),
            ),
            (
                "tone_power_1000_hz_db".into(),
                NpyValue::F64(vec![self.tone_power_1000_hz_db]),
            ),
            (
                "tone_power_1200_hz_db".into(),
                NpyValue::F64(vec![self.tone_power_1200_hz_db]),
            ),
            (
                "wwvh_differential_delay_ms".into(),
                NpyValue::F64(vec![self.wwvh_differential_delay_ms]),
            ),
            (
                "ntp_wall_clock_time".into(),
                NpyValue::F64(vec![self.ntp_wall_clock_time]),
            ),
            ("ntp_offset_ms".into(), NpyValue::F64(vec![self.ntp_offset_ms])),
            ("gaps_count".into(), NpyValue::U32(vec![self.gaps_count])),
            ("gaps_filled".into(), NpyValue::U32(vec![self.gaps_filled])),
            (
                "packets_received".into(),
                NpyValue::U32(vec![self.packets_received]),
            ),
            (
                "packets_expected".into(),
                NpyValue::U32(vec![self.packets_expected]),
            ),
            (
                "gap_rtp_timestamps".into(),
                NpyValue::U32(self.gap_rtp_timestamps.clone()),
            ),
            (
                "gap_sample_indices".into(),
                NpyValue::U32(self.gap_sample_indices.clone()),
            ),
            (
                "gap_samples_filled".into(),
                NpyValue::U32(self.gap_samples_filled.clone()),
            ),
            (
                "gap_packets_lost".into(),
                NpyValue::U32(self.gap_packets_lost.clone()),
            ),
            (
                "recorder_version".into(),
                NpyValue::Str(self.recorder_version.clone()),
            ),
            (
                "created_timestamp".into(),
                NpyValue::F64(vec![self.created_timestamp]),
            ),
        ]
    }

    /// Rebuild a record from NPZ members (analytics read path).
    pub fn from_npz_members(
        members: &HashMap<String, NpyValue>,
    ) -> Result<MinuteArchive, RecorderError> {
        let missing = |k: &str| RecorderError::Fatal(format!("archive missing field {}", k));

        let iq = match members.get("iq") {
            Some(NpyValue::C64(v)) => v.clone(),
            _ => return Err(missing("iq")),
        };
        let u32_vec = |k: &str| -> Result<Vec<u32>, RecorderError> {
            match members.get(k) {
                Some(NpyValue::U32(v)) => Ok(v.clone()),
                _ => Err(missing(k)),
            }
        };
        let u32_scalar = |k: &str| -> Result<u32, RecorderError> {
            members
                .get(k)
                .and_then(|v| v.as_u32_scalar())
                .ok_or_else(|| missing(k))
        };
        let f64_scalar = |k: &str| -> Result<f64, RecorderError> {
            members
                .get(k)
                .and_then(|v| v.as_f64_scalar())
                .ok_or_else(|| missing(k))
        };
        let string = |k: &str| -> Result<String, RecorderError> {
            members
                .get(k)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| missing(k))
        };

        Ok(MinuteArchive {
            iq,
            rtp_timestamp: u32_scalar("rtp_timestamp")?,
            rtp_ssrc: u32_scalar("rtp_ssrc")?,
            sample_rate: u32_scalar("sample_rate")?,
            frequency_hz: f64_scalar("frequency_hz")?,
            channel_name: string("channel_name")?,
            unix_timestamp: f64_scalar("unix_timestamp")?,
            time_snap_rtp: u32_scalar("time_snap_rtp")?,
            time_snap_utc: f64_scalar("time_snap_utc")?,
            time_snap_source: string("time_snap_source")?,
            time_snap_confidence: f64_scalar("time_snap_confidence")?,
            time_snap_station: string("time_snap_station")?,
            tone_power_1000_hz_db: f64_scalar("tone_power_1000_hz_db")?,
            tone_power_1200_hz_db: f64_scalar("tone_power_1200_hz_db")?,
            wwvh_differential_delay_ms: f64_scalar("wwvh_differential_delay_ms")?,
            ntp_wall_clock_time: f64_scalar("ntp_wall_clock_time")?,
            ntp_offset_ms: f64_scalar("ntp_offset_ms")?,
            gaps_count: u32_scalar("gaps_count")?,
            gaps_filled: u32_scalar("gaps_filled")?,
            packets_received: u32_scalar("packets_received")?,
            packets_expected: u32_scalar("packets_expected")?,
            gap_rtp_timestamps: u32_vec("gap_rtp_timestamps")?,
            gap_sample_indices: u32_vec("gap_sample_indices")?,
            gap_samples_filled: u32_vec("gap_samples_filled")?,
            gap_packets_lost: u32_vec("gap_packets_lost")?,
            recorder_version: string("recorder_version")?,
            created_timestamp: f64_scalar("created_timestamp")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_archive() -> MinuteArchive {
        MinuteArchive {
            iq: vec![Complex32::new(0.0, 0.0); 16000 * 60],
            rtp_timestamp: 0,
            rtp_ssrc: 5_000_000,
            sample_rate: 16000,
            frequency_hz: 10_000_000.0,
            channel_name: "WWV 10 MHz".into(),
            unix_timestamp: 1_700_000_040.0,
            time_snap_rtp: 0,
            time_snap_utc: 1_700_000_040.0,
            time_snap_source: "wwv".into(),
            time_snap_confidence: 0.95,
            time_snap_station: "WWV".into(),
            tone_power_1000_hz_db: -12.0,
            tone_power_1200_hz_db: TONE_POWER_SENTINEL,
            wwvh_differential_delay_ms: 0.0,
            ntp_wall_clock_time: 1_700_000_100.1,
            ntp_offset_ms: 1.5,
            gaps_count: 1,
            gaps_filled: 320,
            packets_received: 2999,
            packets_expected: 3000,
            gap_rtp_timestamps: vec![960_000],
            gap_sample_indices: vec![960_000],
            gap_samples_filled: vec![320],
            gap_packets_lost: vec![1],
            recorder_version: "0.1.0".into(),
            created_timestamp: 1_700_000_101.0,
        }
    }

    #[test]
    fn test_completeness() {
        let a = minimal_archive();
        let expected = (1.0 - 320.0 / 960_000.0) * 100.0;
        assert!((a.completeness_pct() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_file_stem_format() {
        let a = minimal_archive();
        // 1_700_000_040 = 2023-11-14T22:14:00Z
        assert_eq!(a.file_stem(), "20231114T221400Z_10000000_iq");
        assert_eq!(a.minute_number(), 14);
    }

    #[test]
    fn test_npz_member_roundtrip() {
        let a = minimal_archive();
        let members: std::collections::HashMap<_, _> =
            a.to_npz_members().into_iter().collect();
        let back = MinuteArchive::from_npz_members(&members).unwrap();
        assert_eq!(back.iq.len(), a.iq.len());
        assert_eq!(back.rtp_timestamp, a.rtp_timestamp);
        assert_eq!(back.time_snap_source, "wwv");
        assert_eq!(back.gap_packets_lost, vec![1]);
        assert_eq!(back.tone_power_1200_hz_db, TONE_POWER_SENTINEL);
    }
}
