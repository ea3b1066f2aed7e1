//! HF time-standard station recorder
//!
//! Captures narrowband I/Q from an upstream SDR daemon over RTP multicast,
//! writes gap-filled one-minute archives with tone-anchored timing
//! metadata, and derives per-minute WWV/WWVH discrimination records.
//!
//! Layout:
//! - one UDP reader thread demultiplexing by SSRC
//! - one capture actor thread per channel (resequencer -> minute writer)
//! - one analytics worker thread per channel (decimation + discrimination)
//! - tokio control plane for the NTP cache refresh, status files and
//!   shutdown

mod analytics;
mod capture;
mod config;
mod dsp;
mod error;
mod station;
mod status;
mod timing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::analytics::worker::{AnalyticsShared, AnalyticsWorker};
use crate::capture::channel::{ChannelActor, ChannelShared};
use crate::capture::demux::Demux;
use crate::config::RecorderConfig;
use crate::timing::ntp::NtpCache;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("timestation-recorder v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => RecorderConfig::load_from_file(&path)?,
        None => RecorderConfig::load()?,
    };
    info!(
        mode = %config.mode,
        data_root = %config.base_dir().display(),
        channels = config.channels.len(),
        "configuration loaded"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    let mut tasks = Vec::new();

    // NTP cache and its refresh loop
    let ntp = Arc::new(NtpCache::new());
    ntp.refresh_once();
    tasks.push(ntp.spawn_refresher(shutdown.clone()));

    // Capture: one shared handle + actor per channel, one demux thread
    let mut channel_shares = Vec::new();
    for channel in &config.channels {
        let shared = Arc::new(ChannelShared::new(channel.clone()));
        channel_shares.push(shared.clone());

        let actor = ChannelActor::new(
            shared,
            config.time_snap.clone(),
            config.archive_dir(channel),
            ntp.clone(),
        );
        threads.push(actor.spawn(shutdown.clone()));
        info!(
            channel = %channel.description,
            ssrc = channel.ssrc,
            sample_rate = channel.sample_rate,
            "channel configured"
        );
    }

    let demux = Demux::new(config.multicast.clone(), channel_shares.clone());
    let demux_stats = demux.stats.clone();
    threads.push(demux.spawn(shutdown.clone()));

    // Analytics: one worker per channel
    let mut analytics_shares = Vec::new();
    for channel in &config.channels {
        let shared = Arc::new(AnalyticsShared::new(channel.description.clone()));
        analytics_shares.push(shared.clone());
        let worker = AnalyticsWorker::new(&config, channel.clone(), shared);
        threads.push(worker.spawn(shutdown.clone()));
    }

    // Status exposition
    let status_dir = config.status_dir();
    {
        let channel_shares = channel_shares.clone();
        let demux_stats = demux_stats.clone();
        let station_meta = config.station.clone();
        tasks.push(status::spawn_status_task(
            status_dir.join("core-status.json"),
            "core".into(),
            shutdown.clone(),
            move || {
                let channels: Vec<_> = channel_shares.iter().map(|c| c.status()).collect();
                let state = channels
                    .iter()
                    .map(|c| format!("{}:{:?}", c.channel, c.state))
                    .collect::<Vec<_>>()
                    .join(",");
                (
                    state,
                    serde_json::json!({
                        "demux": demux_stats.snapshot(),
                        "channels": channels,
                        "station": station_meta,
                    }),
                )
            },
        ));
    }
    {
        let analytics_shares = analytics_shares.clone();
        tasks.push(status::spawn_status_task(
            status_dir.join("analytics-status.json"),
            "analytics".into(),
            shutdown.clone(),
            move || {
                let channels: Vec<_> = analytics_shares.iter().map(|c| c.status()).collect();
                (
                    "RUNNING".to_string(),
                    serde_json::json!({ "channels": channels }),
                )
            },
        ));
    }

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining");
    shutdown.store(true, Ordering::Relaxed);

    for task in tasks {
        task.abort();
    }
    let join = tokio::task::spawn_blocking(move || {
        for t in threads {
            if t.join().is_err() {
                warn!("a worker thread panicked during shutdown");
            }
        }
    });
    join.await.ok();

    info!("recorder stopped");
    Ok(())
}
