//! Status file exposition.
//!
//! Every long-running component group publishes a JSON status document
//! every 10 seconds, written atomically (tmpfile + rename) so readers
//! never observe a torn file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::timing::ntp::system_unix_time;

pub const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Envelope shared by all status documents.
#[derive(Debug, Serialize)]
pub struct StatusDoc<C: Serialize> {
    pub component: String,
    pub uptime_s: u64,
    pub last_event_ts: f64,
    pub current_state: String,
    pub counters: C,
}

/// Atomic write of any serializable document.
pub fn write_status_file<C: Serialize>(path: &Path, doc: &StatusDoc<C>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

/// Periodic status task on the tokio control plane. `collect` produces the
/// counters document on every tick.
pub fn spawn_status_task<C, F>(
    path: PathBuf,
    component: String,
    shutdown: Arc<AtomicBool>,
    collect: F,
) -> tokio::task::JoinHandle<()>
where
    C: Serialize + Send + 'static,
    F: Fn() -> (String, C) + Send + 'static,
{
    let started = Instant::now();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let (state, counters) = collect();
            let doc = StatusDoc {
                component: component.clone(),
                uptime_s: started.elapsed().as_secs(),
                last_event_ts: system_unix_time(),
                current_state: state,
                counters,
            };
            if let Err(e) = write_status_file(&path, &doc) {
                warn!(path = %path.display(), error = %e, "status write failed");
            }
        }
        info!(component = %component, "status task stopped");
    })
}
