//! UDP transport — the one socket everything rides on.
//!
//! Broadcast and unicast sends are fire-and-forget. Reliable sends register
//! an ACK waiter keyed by MESSAGE_ID and hand the frame to a retry task:
//! initial transmission, a retransmit after each schedule interval, then a
//! short grace wait before resolving `Failed`. The dispatcher calls
//! [`Transport::note_ack`] when an ACK arrives, which discharges the lane.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use lsnp_core::wire::Frame;

/// Grace period after the final retransmission before a reliable send
/// resolves `Failed`. Keeps terminality within Σ schedule + ε.
const ACK_GRACE: Duration = Duration::from_secs(1);

/// Terminal state of a reliable send. Exactly one of these resolves per
/// send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    Failed,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    ack_waiters: Arc<DashMap<String, oneshot::Sender<()>>>,
    retry_schedule: Arc<Vec<Duration>>,
}

impl Transport {
    /// Bind the shared LSNP socket with broadcast and address reuse enabled.
    /// A bind failure is fatal — the engine cannot run without the port.
    pub fn bind(port: u16, broadcast_override: &str, retry_schedule_secs: &[u64]) -> Result<Self> {
        let socket = make_socket(port).context("failed to create LSNP socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio socket")?;
        let bound_port = socket.local_addr().context("local_addr")?.port();

        let broadcast_ip: Ipv4Addr = if broadcast_override.is_empty() {
            Ipv4Addr::BROADCAST
        } else {
            broadcast_override
                .parse()
                .with_context(|| format!("bad broadcast_addr {broadcast_override:?}"))?
        };

        let retry_schedule = retry_schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();

        Ok(Self {
            socket: Arc::new(socket),
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(broadcast_ip, bound_port)),
            ack_waiters: Arc::new(DashMap::new()),
            retry_schedule: Arc::new(retry_schedule),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("local_addr")
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Best-effort broadcast. Send errors are logged, never propagated — a
    /// missed PROFILE is repaired by the next interval.
    pub async fn send_broadcast(&self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, self.broadcast_addr).await {
                    tracing::warn!(error = %e, dest = %self.broadcast_addr, "broadcast send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "broadcast frame encode failed"),
        }
    }

    /// Best-effort unicast.
    pub async fn send_unicast(&self, frame: &Frame, dest: SocketAddr) {
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, dest).await {
                    tracing::warn!(error = %e, %dest, "unicast send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "unicast frame encode failed"),
        }
    }

    /// Reliable unicast: transmit, retransmit per schedule, resolve
    /// `Acked` on a matching ACK or `Failed` on exhaustion. The returned
    /// future resolves exactly once.
    ///
    /// Lanes are keyed by `(destination, MESSAGE_ID)`: a group fan-out
    /// reuses one MESSAGE_ID across recipients, and each recipient's ACK
    /// must discharge only its own lane.
    pub fn send_reliable(&self, frame: &Frame, dest: SocketAddr) -> oneshot::Receiver<Delivery> {
        let (done_tx, done_rx) = oneshot::channel();

        let message_id = match frame.message_id() {
            Some(id) => id.to_string(),
            None => {
                tracing::error!(frame_type = %frame.frame_type(), "reliable send without MESSAGE_ID");
                let _ = done_tx.send(Delivery::Failed);
                return done_rx;
            }
        };
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "reliable frame encode failed");
                let _ = done_tx.send(Delivery::Failed);
                return done_rx;
            }
        };

        let key = lane_key(&message_id, dest);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.ack_waiters.insert(key.clone(), ack_tx);

        let socket = self.socket.clone();
        let waiters = self.ack_waiters.clone();
        let schedule = self.retry_schedule.clone();
        tokio::spawn(async move {
            let outcome = retry_until_acked(&socket, dest, &bytes, ack_rx, &schedule, &message_id).await;
            waiters.remove(&key);
            let _ = done_tx.send(outcome);
        });

        done_rx
    }

    /// Discharge the retry lane for a MESSAGE_ID acked from `from`.
    /// Returns false when no lane is waiting (late or foreign ACK).
    pub fn note_ack(&self, message_id: &str, from: SocketAddr) -> bool {
        match self.ack_waiters.remove(&lane_key(message_id, from)) {
            Some((_, tx)) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Lanes currently awaiting an ACK.
    pub fn pending_acks(&self) -> usize {
        self.ack_waiters.len()
    }
}

fn lane_key(message_id: &str, dest: SocketAddr) -> String {
    format!("{dest}|{message_id}")
}

async fn retry_until_acked(
    socket: &UdpSocket,
    dest: SocketAddr,
    bytes: &Bytes,
    mut ack_rx: oneshot::Receiver<()>,
    schedule: &[Duration],
    message_id: &str,
) -> Delivery {
    if let Err(e) = socket.send_to(bytes, dest).await {
        tracing::warn!(error = %e, %dest, message_id, "initial send failed");
    }

    for delay in schedule {
        tokio::select! {
            _ = &mut ack_rx => return Delivery::Acked,
            _ = tokio::time::sleep(*delay) => {
                tracing::debug!(message_id, %dest, "retransmitting unacked frame");
                if let Err(e) = socket.send_to(bytes, dest).await {
                    tracing::warn!(error = %e, %dest, message_id, "retransmit failed");
                }
            }
        }
    }

    tokio::select! {
        _ = &mut ack_rx => Delivery::Acked,
        _ = tokio::time::sleep(ACK_GRACE) => {
            tracing::debug!(message_id, %dest, "retries exhausted, delivery failed");
            Delivery::Failed
        }
    }
}

fn make_socket(port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&SocketAddr::V4(bind_addr).into())
        .with_context(|| format!("failed to bind UDP port {port}"))?;

    Ok(socket.into())
}

/// Best guess at the outbound IPv4 interface address, via a routing probe.
/// No packet is sent. Falls back to loopback on isolated hosts.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        match socket.local_addr()? {
            SocketAddr::V4(v4) => Ok(*v4.ip()),
            SocketAddr::V6(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "expected IPv4 local address",
            )),
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsnp_core::wire::FrameType;

    fn chat_frame(message_id: &str) -> Frame {
        Frame::new(FrameType::Chat)
            .with("MESSAGE_ID", message_id)
            .with("FROM", "alice@192.168.1.10")
            .with("TO", "bob@192.168.1.11")
            .with("TOKEN", "alice@192.168.1.10|1999999999|chat")
            .with_body(Bytes::from_static(b"hi"))
    }

    #[tokio::test]
    async fn reliable_send_resolves_acked_on_note_ack() {
        let transport = Transport::bind(0, "", &[1]).unwrap();
        let dest = transport.local_addr().unwrap();

        let delivery = transport.send_reliable(&chat_frame("m1"), dest);
        assert_eq!(transport.pending_acks(), 1);
        assert!(transport.note_ack("m1", dest));
        assert_eq!(delivery.await.unwrap(), Delivery::Acked);
        assert_eq!(transport.pending_acks(), 0);
    }

    #[tokio::test]
    async fn reliable_send_fails_after_exhaustion() {
        let transport = Transport::bind(0, "", &[]).unwrap();
        // Nobody ACKs; empty schedule means only the grace wait.
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let delivery = transport.send_reliable(&chat_frame("m2"), dest);
        assert_eq!(delivery.await.unwrap(), Delivery::Failed);
        assert_eq!(transport.pending_acks(), 0);
    }

    #[tokio::test]
    async fn note_ack_for_unknown_id_is_false() {
        let transport = Transport::bind(0, "", &[1]).unwrap();
        let dest = transport.local_addr().unwrap();
        assert!(!transport.note_ack("nope", dest));
    }

    #[tokio::test]
    async fn shared_message_id_lanes_resolve_independently() {
        let transport = Transport::bind(0, "", &[1]).unwrap();
        let dest_a: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let dest_b: SocketAddr = "127.0.0.1:10".parse().unwrap();

        let delivery_a = transport.send_reliable(&chat_frame("shared"), dest_a);
        let delivery_b = transport.send_reliable(&chat_frame("shared"), dest_b);
        assert_eq!(transport.pending_acks(), 2);

        assert!(transport.note_ack("shared", dest_a));
        assert_eq!(delivery_a.await.unwrap(), Delivery::Acked);
        // The other lane runs its schedule out and fails on its own.
        assert_eq!(delivery_b.await.unwrap(), Delivery::Failed);
    }

    #[tokio::test]
    async fn reliable_send_without_message_id_fails_immediately() {
        let transport = Transport::bind(0, "", &[1]).unwrap();
        let dest = transport.local_addr().unwrap();
        let frame = Frame::new(FrameType::Revoke).with("USER_ID", "a@1.2.3.4");
        let delivery = transport.send_reliable(&frame, dest);
        assert_eq!(delivery.await.unwrap(), Delivery::Failed);
    }
}
