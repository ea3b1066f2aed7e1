//! RTP demultiplexer: one UDP multicast reader for all channels.
//!
//! Reads datagrams, parses the full RTP header, and dispatches payloads to
//! the per-SSRC channel queues. Unknown SSRCs and malformed packets are
//! counted and dropped. Socket errors reopen the socket with bounded
//! backoff.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::capture::channel::ChannelShared;
use crate::capture::resequencer::RawPacket;
use crate::capture::rtp::RtpPacket;
use crate::config::MulticastConfig;
use crate::error::RecorderError;

const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);
const REOPEN_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct DemuxStats {
    pub packets_received: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub unknown_ssrc_packets: AtomicU64,
    pub socket_reopens: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DemuxStatsSnapshot {
    pub packets_received: u64,
    pub malformed_packets: u64,
    pub unknown_ssrc_packets: u64,
    pub socket_reopens: u64,
}

impl DemuxStats {
    pub fn snapshot(&self) -> DemuxStatsSnapshot {
        DemuxStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            unknown_ssrc_packets: self.unknown_ssrc_packets.load(Ordering::Relaxed),
            socket_reopens: self.socket_reopens.load(Ordering::Relaxed),
        }
    }
}

pub struct Demux {
    config: MulticastConfig,
    channels: HashMap<u32, Arc<ChannelShared>>,
    pub stats: Arc<DemuxStats>,
}

impl Demux {
    pub fn new(config: MulticastConfig, channels: Vec<Arc<ChannelShared>>) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.config.ssrc, c))
            .collect();
        Self {
            config,
            channels,
            stats: Arc::new(DemuxStats::default()),
        }
    }

    /// Spawn the reader thread.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("rtp-demux".into())
            .spawn(move || {
                if let Err(e) = self.run(shutdown) {
                    error!(error = %e, "demux thread failed");
                }
            })
            .expect("failed to spawn demux thread")
    }

    fn run(&self, shutdown: Arc<AtomicBool>) -> Result<(), RecorderError> {
        let mut socket = self.open_with_backoff(&shutdown)?;
        let mut buf = [0u8; 4096];

        info!(
            group = %self.config.group,
            port = self.config.port,
            channels = self.channels.len(),
            "rtp demux listening"
        );

        while !shutdown.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    self.dispatch(&buf[..len]);
                }
                Err(ref e) if would_block(e) => {
                    // Read timeout: check the shutdown flag and continue
                }
                Err(e) => {
                    warn!(error = %e, "socket error, reopening");
                    self.stats.socket_reopens.fetch_add(1, Ordering::Relaxed);
                    socket = self.open_with_backoff(&shutdown)?;
                }
            }
        }

        info!("rtp demux stopped");
        Ok(())
    }

    fn dispatch(&self, datagram: &[u8]) {
        let pkt = match RtpPacket::parse(datagram) {
            Some(p) => p,
            None => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);

        match self.channels.get(&pkt.header.ssrc) {
            Some(channel) => {
                channel.queue.push(RawPacket {
                    seq: pkt.header.sequence,
                    rtp: pkt.header.timestamp,
                    payload: Bytes::copy_from_slice(pkt.payload),
                    arrived: Instant::now(),
                });
            }
            None => {
                self.stats
                    .unknown_ssrc_packets
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn open_with_backoff(&self, shutdown: &AtomicBool) -> Result<UdpSocket, RecorderError> {
        let mut backoff = Duration::from_millis(500);
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(RecorderError::Transient("shutdown during reopen".into()));
            }
            match open_multicast_socket(&self.config) {
                Ok(s) => return Ok(s),
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "socket open failed");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(REOPEN_BACKOFF_MAX);
                }
            }
        }
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Create the multicast receive socket with address reuse and group join.
pub fn open_multicast_socket(config: &MulticastConfig) -> Result<UdpSocket, RecorderError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let group: Ipv4Addr = config
        .group
        .parse()
        .map_err(|_| RecorderError::Fatal(format!("bad multicast group {:?}", config.group)))?;
    let interface: Ipv4Addr = match &config.interface {
        Some(s) => s
            .parse()
            .map_err(|_| RecorderError::Fatal(format!("bad interface address {:?}", s)))?,
        None => Ipv4Addr::UNSPECIFIED,
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    socket.bind(&addr.into())?;
    socket.join_multicast_v4(&group, &interface)?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
    Ok(socket)
}
