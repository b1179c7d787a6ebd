//! UDP multicast stand-in for the radio: every node on the group hears every frame.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lora_core::protocol::MAX_DRIVER_FRAME;
use lora_core::{DriverError, NodeId, RadioDriver};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

/// Frames queue up from a background reader task; `receive` never blocks.
pub struct UdpRadio {
    rx: UnboundedReceiver<Vec<u8>>,
    tx_socket: std::net::UdpSocket,
    group: SocketAddr,
}

impl UdpRadio {
    /// Join `group:port` and start the reader task. Must be called inside a tokio runtime.
    /// The returned `Notify` fires whenever a frame is queued.
    pub fn open(local_id: NodeId, group: Ipv4Addr, port: u16) -> Result<(Self, Arc<Notify>)> {
        let recv_socket = multicast_socket(group, port)?;
        let tx_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .context("failed to bind send socket")?;
        tx_socket
            .set_multicast_ttl_v4(1)
            .context("failed to set multicast ttl")?;
        tx_socket
            .set_multicast_loop_v4(true)
            .context("failed to enable multicast loop")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ready = Arc::new(Notify::new());
        tokio::spawn(read_loop(recv_socket, local_id, tx, ready.clone()));

        let group = SocketAddr::V4(SocketAddrV4::new(group, port));
        tracing::info!(%group, node = %local_id, "radio channel joined");
        Ok((Self { rx, tx_socket, group }, ready))
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create udp socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind.into())
        .with_context(|| format!("failed to bind {bind}"))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("failed to join {group}"))?;
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to register socket with tokio")
}

const RECEIVE_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying after `failures` consecutive receive errors (doubling, capped).
fn receive_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECEIVE_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(RECEIVE_BACKOFF_MAX)
}

/// Our own transmissions loop back through the group; byte 1 is the source id.
fn is_own_frame(frame: &[u8], local_id: NodeId) -> bool {
    frame.get(1) == Some(&local_id.as_u8())
}

async fn read_loop(
    socket: UdpSocket,
    local_id: NodeId,
    tx: UnboundedSender<Vec<u8>>,
    ready: Arc<Notify>,
) {
    let mut buf = vec![0u8; 2048];
    let mut failures = 0u32;
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => {
                failures = 0;
                r
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = receive_backoff(failures);
                tracing::warn!(error = %e, failures, ?delay, "radio receive failed");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        if n > MAX_DRIVER_FRAME {
            tracing::debug!(%from, len = n, "oversized datagram dropped");
            continue;
        }
        let frame = &buf[..n];
        if is_own_frame(frame, local_id) {
            continue;
        }
        if tx.send(frame.to_vec()).is_err() {
            break;
        }
        ready.notify_one();
    }
}

impl RadioDriver for UdpRadio {
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> Result<(), DriverError> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.tx_socket.set_write_timeout(timeout)?;
        self.tx_socket.send_to(frame, self.group)?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DriverError> {
        match self.rx.try_recv() {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(Some(n))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(DriverError::Closed),
        }
    }
}
