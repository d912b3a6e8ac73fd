//! Multicast channels: one UDP socket per group, a receive loop that hands every
//! datagram to its own task, and a queue-fed writer so sends never block the caller.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use shoal_core::wire::{self, MAX_DATAGRAM_LEN};
use shoal_core::{Channel, Message};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Pause after a failed receive so a persistent socket error does not spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the group's port, join the group on all interfaces, TTL 1, loopback on.
pub fn open(group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port()))?;
    std_sock.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Receive forever. Each datagram is decoded and handled on a fresh task; undecodable
/// datagrams are dropped. Receive errors are logged and never end the loop.
pub async fn receive_loop<F, Fut>(kind: Channel, socket: Arc<UdpSocket>, handler: F)
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("{} receive failed: {}", kind, e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };
        let datagram = buf[..n].to_vec();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            match wire::decode(&datagram) {
                Ok(msg) => handler(msg).await,
                Err(e) => tracing::debug!("dropping datagram from {} on {}: {}", from, kind, e),
            }
        });
    }
}

/// Spawn the writer task for one channel. Returns the queue feeding it.
pub fn spawn_writer(
    kind: Channel,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            if let Err(e) = socket.send_to(&datagram, dest).await {
                tracing::warn!("{} send to {} failed: {}", kind, dest, e);
            }
        }
    });
    tx
}

/// Fire-and-forget sender routing each message to its type's channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    mc: mpsc::UnboundedSender<Vec<u8>>,
    mdb: mpsc::UnboundedSender<Vec<u8>>,
    mdr: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbound {
    pub fn new(
        mc: mpsc::UnboundedSender<Vec<u8>>,
        mdb: mpsc::UnboundedSender<Vec<u8>>,
        mdr: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self { mc, mdb, mdr }
    }

    /// Enqueue without waiting. Safe from any number of tasks at once.
    pub fn send(&self, msg: &Message) {
        let kind = msg.channel();
        let queue = match kind {
            Channel::Control => &self.mc,
            Channel::Backup => &self.mdb,
            Channel::Restore => &self.mdr,
        };
        tracing::trace!("{} {} {:?}", kind, msg.kind, msg.chunk_key());
        if queue.send(wire::encode(msg)).is_err() {
            tracing::warn!("{} writer stopped, dropping {}", kind, msg.kind);
        }
    }
}

/// Outbound whose queues are drained by the caller instead of sockets.
#[cfg(test)]
pub struct Captured {
    pub mc: mpsc::UnboundedReceiver<Vec<u8>>,
    pub mdb: mpsc::UnboundedReceiver<Vec<u8>>,
    pub mdr: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[cfg(test)]
impl Captured {
    pub fn new() -> (Outbound, Self) {
        let (mc, mc_rx) = mpsc::unbounded_channel();
        let (mdb, mdb_rx) = mpsc::unbounded_channel();
        let (mdr, mdr_rx) = mpsc::unbounded_channel();
        (
            Outbound::new(mc, mdb, mdr),
            Self {
                mc: mc_rx,
                mdb: mdb_rx,
                mdr: mdr_rx,
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            if let Ok(msg) = wire::decode(&bytes) {
                out.push(msg);
            }
        }
        out
    }

    pub fn control(&mut self) -> Vec<Message> {
        Self::drain(&mut self.mc)
    }

    pub fn backup(&mut self) -> Vec<Message> {
        Self::drain(&mut self.mdb)
    }

    pub fn restore(&mut self) -> Vec<Message> {
        Self::drain(&mut self.mdr)
    }
}
