//! The optional Sticky Dispatcher: the master accepts connections itself and
//! routes each to a worker selected by hashing the peer address, so a given
//! peer consistently lands on the same worker for the master's lifetime.
//!
//! Handing the accepted socket to the worker directly would need passing a
//! raw fd over the IPC pipe (`SCM_RIGHTS`), which needs `unsafe`. Every
//! crate in this workspace denies it, so this hands over the *connection*,
//! not the descriptor: the master relays bytes between the publicly
//! accepted socket and a private loopback port the chosen worker listens on
//! (`relay_base_port + worker_id`), while telling the worker which peer it's
//! serving via [`ipc::ToWorker::StickyBalance`]. See DESIGN.md.

use std::net::SocketAddr;

use config::StickyConfig;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::events::SupervisorEvent;

/// Seeded peer-address hashing and worker selection.
pub(crate) struct StickyDispatcher {
    seed: u64,
    num_workers: u32,
}

impl StickyDispatcher {
    /// Creates a dispatcher with a hash seed drawn once, at master start, so
    /// that a given peer consistently reaches the same worker across the
    /// master's lifetime.
    pub(crate) fn new(num_workers: u32) -> Self {
        Self {
            seed: rand::random(),
            num_workers,
        }
    }

    /// Selects `workers[(h mod N) + 1]` for the given peer address.
    pub(crate) fn select_worker(&self, peer: SocketAddr) -> u32 {
        let mixed = mix(self.seed, peer);
        (mixed % self.num_workers as u64) as u32 + 1
    }
}

/// A small, stable FNV-1a-style mixing function over the seed and the
/// peer's IP and port.
fn mix(seed: u64, peer: SocketAddr) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET ^ seed;
    for byte in peer.ip().to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    for byte in peer.port().to_be_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Accepts connections on `sticky.listen_addr` and relays each to the
/// chosen worker's private loopback port for as long as the listener is
/// alive. The routing decision is reported back to the main event loop as a
/// [`SupervisorEvent::StickyRouted`] rather than mutating the worker map
/// directly from this task.
pub(crate) async fn accept_loop(
    sticky: StickyConfig,
    dispatcher: StickyDispatcher,
    events_tx: mpsc::Sender<SupervisorEvent>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&sticky.listen_addr).await?;
    tracing::info!(addr = %sticky.listen_addr, "sticky dispatcher listening");

    loop {
        let (inbound, peer) = listener.accept().await?;
        let worker_id = dispatcher.select_worker(peer);

        if events_tx
            .send(SupervisorEvent::StickyRouted {
                worker_id,
                peer_addr: peer.to_string(),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let relay_port = sticky.relay_base_port + worker_id as u16;
        let _ = tokio::spawn(async move {
            match TcpStream::connect(("127.0.0.1", relay_port)).await {
                Ok(mut outbound) => {
                    let mut inbound = inbound;
                    if let Err(err) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                        tracing::debug!(%peer, worker_id, error = %err, "sticky relay ended");
                    }
                }
                Err(err) => {
                    tracing::warn!(%peer, worker_id, relay_port, error = %err, "failed to connect to worker's relay port");
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_peer_always_selects_same_worker() {
        let dispatcher = StickyDispatcher::new(4);
        let peer: SocketAddr = "203.0.113.7:54321".parse().unwrap();

        let first = dispatcher.select_worker(peer);
        let second = dispatcher.select_worker(peer);
        assert_eq!(first, second);
        assert!((1..=4).contains(&first));
    }

    #[test]
    fn selection_is_within_worker_range() {
        let dispatcher = StickyDispatcher::new(3);
        for port in 0..200u16 {
            let peer: SocketAddr = format!("198.51.100.{}:{}", port % 255, port).parse().unwrap();
            let worker = dispatcher.select_worker(peer);
            assert!((1..=3).contains(&worker));
        }
    }
}
