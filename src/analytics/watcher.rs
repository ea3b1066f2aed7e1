//! Archive directory watcher.
//!
//! Polls a channel's archive directory for new minute records and hands
//! them to the analytics worker in UTC order. A persistent state file
//! remembers the last processed record so a restart resumes cleanly; late
//! arrivals (files sorting before the resume point) are still processed,
//! with a log line, and deduplicated within the session.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Persisted resume state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatcherState {
    pub last_processed_record_id: Option<String>,
}

pub struct ArchiveWatcher {
    archive_dir: PathBuf,
    state_path: PathBuf,
    state: WatcherState,
    /// Record ids handled this session (covers late arrivals).
    seen: HashSet<String>,
}

impl ArchiveWatcher {
    pub fn new(archive_dir: PathBuf, state_path: PathBuf) -> Self {
        let state = load_state(&state_path);
        if let Some(last) = &state.last_processed_record_id {
            info!(
                dir = %archive_dir.display(),
                last = %last,
                "archive watcher resuming"
            );
        }
        Self {
            archive_dir,
            state_path,
            state,
            seen: HashSet::new(),
        }
    }

    /// New record files, sorted by record id (the id starts with the UTC
    /// timestamp, so lexical order is time order).
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(), // directory not created yet
        };

        let mut fresh: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "npz").unwrap_or(false))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?.to_string();
                Some((stem, p))
            })
            .filter(|(stem, _)| !self.seen.contains(stem))
            .collect();
        fresh.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (stem, path) in fresh {
            if let Some(last) = &self.state.last_processed_record_id {
                if stem <= *last {
                    warn!(record = %stem, "late-arriving archive, processing out of order");
                }
            }
            out.push(path);
        }
        debug!(
            dir = %self.archive_dir.display(),
            count = out.len(),
            "watcher poll"
        );
        out
    }

    /// Record a processed file and persist the resume point.
    pub fn mark_processed(&mut self, path: &Path) -> Result<()> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        self.seen.insert(stem.clone());

        let advance = self
            .state
            .last_processed_record_id
            .as_ref()
            .map(|last| stem > *last)
            .unwrap_or(true);
        if advance {
            self.state.last_processed_record_id = Some(stem);
            self.persist()?;
        }
        Ok(())
    }

    pub fn last_processed(&self) -> Option<&str> {
        self.state.last_processed_record_id.as_deref()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("renaming to {}", self.state_path.display()))?;
        Ok(())
    }
}

fn load_state(path: &Path) -> WatcherState {
    match fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "corrupt watcher state, starting fresh");
            WatcherState::default()
        }),
        Err(_) => WatcherState::default(),
    }
}
