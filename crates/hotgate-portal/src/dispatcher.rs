//! Per-peer FIFO queues with one consumer task each.
//!
//! Jobs from the same address run strictly in submission order; different
//! addresses run concurrently. A consumer that sees no work for `idle`
//! deregisters itself and exits, and the next job for that address starts a
//! fresh one.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

pub const DEFAULT_PEER_IDLE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: J);
}

struct PeerQueue<J> {
    id: u64,
    tx: UnboundedSender<J>,
}

struct Inner<J> {
    peers: DashMap<IpAddr, PeerQueue<J>>,
    handler: Arc<dyn JobHandler<J>>,
    idle: Duration,
    next_id: AtomicU64,
}

pub struct PeerDispatcher<J> {
    inner: Arc<Inner<J>>,
}

impl<J> Clone for PeerDispatcher<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J: Send + 'static> PeerDispatcher<J> {
    pub fn new(handler: Arc<dyn JobHandler<J>>, idle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: DashMap::new(),
                handler,
                idle,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `job` behind earlier jobs from `peer`. Never blocks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, peer: IpAddr, job: J) {
        match self.inner.peers.entry(peer) {
            Entry::Occupied(mut slot) => {
                if let Err(mpsc::error::SendError(job)) = slot.get().tx.send(job) {
                    // The consumer died without deregistering (handler panic).
                    warn!(%peer, "Peer consumer gone, restarting it");
                    slot.insert(self.start_consumer(peer, job));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(self.start_consumer(peer, job));
            }
        }
    }

    /// Addresses with a live consumer.
    pub fn active_peers(&self) -> usize {
        self.inner.peers.len()
    }

    fn start_consumer(&self, peer: IpAddr, first: J) -> PeerQueue<J> {
        let (tx, rx) = mpsc::unbounded_channel();
        // A fresh receiver is alive, so this cannot fail.
        let _ = tx.send(first);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, id, "Starting peer consumer");
        tokio::spawn(consume(self.inner.clone(), peer, id, rx));
        PeerQueue { id, tx }
    }
}

async fn consume<J: Send + 'static>(
    inner: Arc<Inner<J>>,
    peer: IpAddr,
    id: u64,
    mut rx: UnboundedReceiver<J>,
) {
    loop {
        match tokio::time::timeout(inner.idle, rx.recv()).await {
            Ok(Some(job)) => inner.handler.handle(job).await,
            Ok(None) => break,
            Err(_) => {
                // Submitters send while holding the map entry, so an empty
                // queue observed under the same lock stays empty.
                let retired = inner
                    .peers
                    .remove_if(&peer, |_, queue| queue.id == id && rx.is_empty())
                    .is_some();
                if retired {
                    debug!(%peer, id, "Peer consumer idle, retiring");
                    break;
                }
            }
        }
    }
}
