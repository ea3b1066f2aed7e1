//! Discrimination output writer.
//!
//! One row per minute per channel, appended to a daily CSV. Array-valued
//! columns (tick windows, BCD windows) are serialized as JSON inside a
//! quoted CSV field. Writes are idempotent: reprocessing a minute replaces
//! the row keyed by `minute_timestamp` instead of duplicating it.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::analytics::bcd::BcdWindow;
use crate::analytics::ticks::TickWindow;

pub const CSV_HEADER: &str = "timestamp_utc,minute_timestamp,minute_number,\
wwv_detected,wwvh_detected,wwv_power_db,wwvh_power_db,power_ratio_db,\
differential_delay_ms,tone_440hz_wwv_detected,tone_440hz_wwv_power_db,\
tone_440hz_wwvh_detected,tone_440hz_wwvh_power_db,dominant_station,confidence,\
tick_windows,bcd_wwv_amplitude,bcd_wwvh_amplitude,bcd_differential_delay_ms,\
bcd_correlation_quality,bcd_windows";

/// One CSV row, already reduced to output form.
#[derive(Debug, Clone)]
pub struct DiscriminationRecord {
    pub minute_timestamp: i64,
    pub minute_number: u32,
    pub wwv_detected: bool,
    pub wwvh_detected: bool,
    pub wwv_power_db: f64,
    pub wwvh_power_db: f64,
    pub power_ratio_db: f64,
    pub differential_delay_ms: f64,
    pub tone_440hz_wwv_detected: bool,
    pub tone_440hz_wwv_power_db: f64,
    pub tone_440hz_wwvh_detected: bool,
    pub tone_440hz_wwvh_power_db: f64,
    pub dominant_station: String,
    pub confidence: String,
    pub tick_windows: Vec<TickWindow>,
    pub bcd_wwv_amplitude: f64,
    pub bcd_wwvh_amplitude: f64,
    pub bcd_differential_delay_ms: f64,
    pub bcd_correlation_quality: f64,
    pub bcd_windows: Vec<BcdWindow>,
}

impl DiscriminationRecord {
    fn to_row(&self) -> String {
        let ts = DateTime::<Utc>::from_timestamp(self.minute_timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        let tick_json =
            serde_json::to_string(&self.tick_windows).unwrap_or_else(|_| "[]".into());
        let bcd_json =
            serde_json::to_string(&self.bcd_windows).unwrap_or_else(|_| "[]".into());

        [
            ts,
            self.minute_timestamp.to_string(),
            self.minute_number.to_string(),
            self.wwv_detected.to_string(),
            self.wwvh_detected.to_string(),
            fmt_db(self.wwv_power_db),
            fmt_db(self.wwvh_power_db),
            fmt_db(self.power_ratio_db),
            format!("{:.3}", self.differential_delay_ms),
            self.tone_440hz_wwv_detected.to_string(),
            fmt_db(self.tone_440hz_wwv_power_db),
            self.tone_440hz_wwvh_detected.to_string(),
            fmt_db(self.tone_440hz_wwvh_power_db),
            self.dominant_station.clone(),
            self.confidence.clone(),
            csv_escape(&tick_json),
            format!("{:.4}", self.bcd_wwv_amplitude),
            format!("{:.4}", self.bcd_wwvh_amplitude),
            format!("{:.3}", self.bcd_differential_delay_ms),
            format!("{:.2}", self.bcd_correlation_quality),
            csv_escape(&bcd_json),
        ]
        .join(",")
    }
}

fn fmt_db(v: f64) -> String {
    if v.is_finite() {
        format!("{:.2}", v)
    } else {
        "-999.00".into()
    }
}

/// Quote a field and double internal quotes.
fn csv_escape(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Writes daily per-channel CSVs.
pub struct DiscriminationWriter {
    dir: PathBuf,
    channel_key: String,
}

impl DiscriminationWriter {
    pub fn new(dir: PathBuf, channel_key: String) -> Self {
        Self { dir, channel_key }
    }

    /// Daily file for a given minute.
    pub fn path_for(&self, minute_timestamp: i64) -> PathBuf {
        let date = DateTime::<Utc>::from_timestamp(minute_timestamp, 0)
            .map(|dt| dt.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "00000000".into());
        self.dir
            .join(format!("{}_discrimination_{}.csv", self.channel_key, date))
    }

    /// Insert or replace the row for this record's minute.
    pub fn write(&self, record: &DiscriminationRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(record.minute_timestamp);

        let mut rows: Vec<String> = match fs::read_to_string(&path) {
            Ok(existing) => existing
                .lines()
                .skip(1) // header
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect(),
            Err(_) => Vec::new(),
        };

        let key = record.minute_timestamp.to_string();
        let new_row = record.to_row();
        match rows.iter_mut().find(|r| row_minute(r) == Some(key.as_str())) {
            Some(existing) => *existing = new_row,
            None => rows.push(new_row),
        }
        rows.sort_by_key(|r| {
            row_minute(r)
                .and_then(|m| m.parse::<i64>().ok())
                .unwrap_or(i64::MAX)
        });

        let mut content = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum::<usize>() + 256);
        content.push_str(CSV_HEADER);
        content.push('\n');
        for row in rows {
            content.push_str(&row);
            content.push('\n');
        }

        let tmp = path.with_extension("csv.tmp");
        fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(path)
    }
}

/// Second column of a row, the minute timestamp.
fn row_minute(row: &str) -> Option<&str> {
    row.split(',').nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(minute: i64, dominant: &str) -> DiscriminationRecord {
        DiscriminationRecord {
            minute_timestamp: minute,
            minute_number: 14,
            wwv_detected: true,
            wwvh_detected: false,
            wwv_power_db: -12.5,
            wwvh_power_db: f64::NEG_INFINITY,
            power_ratio_db: 20.0,
            differential_delay_ms: 0.0,
            tone_440hz_wwv_detected: false,
            tone_440hz_wwv_power_db: -60.0,
            tone_440hz_wwvh_detected: false,
            tone_440hz_wwvh_power_db: -60.0,
            dominant_station: dominant.into(),
            confidence: "high".into(),
            tick_windows: vec![],
            bcd_wwv_amplitude: 1.0,
            bcd_wwvh_amplitude: 0.1,
            bcd_differential_delay_ms: 0.0,
            bcd_correlation_quality: 5.2,
            bcd_windows: vec![BcdWindow {
                window_start_sec: 0.0,
                wwv_amplitude: 1.0,
                wwvh_amplitude: 0.1,
                differential_delay_ms: 0.0,
                correlation_quality: 5.2,
            }],
        }
    }

    #[test]
    fn test_write_creates_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let w = DiscriminationWriter::new(dir.path().to_path_buf(), "WWV_10_MHz".into());
        let path = w.write(&record(1_700_000_040, "WWV")).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "WWV_10_MHz_discrimination_20231114.csv"
        );
        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("timestamp_utc,"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("2023-11-14T22:14:00Z,1700000040,14,true,false,"));
        assert!(row.contains(",WWV,high,"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let w = DiscriminationWriter::new(dir.path().to_path_buf(), "ch".into());
        w.write(&record(1_700_000_040, "WWV")).unwrap();
        w.write(&record(1_700_000_100, "WWVH")).unwrap();
        // Reprocess the first minute with a different outcome
        let path = w.write(&record(1_700_000_040, "BALANCED")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("1700000040"));
        assert!(rows[0].contains("BALANCED"));
        assert!(rows[1].contains("1700000100"));
        assert!(rows[1].contains("WWVH"));
    }

    #[test]
    fn test_json_columns_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let w = DiscriminationWriter::new(dir.path().to_path_buf(), "ch".into());
        let path = w.write(&record(1_700_000_040, "WWV")).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();

        // Extract the last quoted field (bcd_windows) and parse the JSON
        let start = row.rfind(",\"").unwrap() + 1;
        let quoted = &row[start..];
        let json = quoted[1..quoted.len() - 1].replace("\"\"", "\"");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["wwv_amplitude"], 1.0);
    }

    #[test]
    fn test_sentinel_for_non_finite() {
        assert_eq!(fmt_db(f64::NEG_INFINITY), "-999.00");
        assert_eq!(fmt_db(-12.345), "-12.35");
    }
}
