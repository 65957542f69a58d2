//! The peer-list oracle.
//!
//! How peers are found (tracker announces, DHT, PEX, manual addition) is
//! the daemon's business. The engine only ever asks the oracle for more
//! candidates when a torrent runs low on connections, and reports
//! endpoints that failed so the oracle can dampen their re-use.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
};

use async_trait::async_trait;

use crate::InfoHash;

/// The source of peer candidates for torrents.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Returns up to `max` candidate endpoints for the torrent. The engine
    /// filters out peers it is already connected to or has blacklisted, so
    /// repeats are fine.
    async fn next_peers(
        &self,
        info_hash: InfoHash,
        max: usize,
    ) -> Vec<SocketAddr>;

    /// Reports an endpoint that could not be connected to.
    async fn report_failure(&self, info_hash: InfoHash, addr: SocketAddr);
}

/// A fixed candidate list, mainly for tests and single-peer setups. Failed
/// endpoints are demoted to the end of the list rather than dropped, so a
/// flaky peer is retried only when nothing better is left.
#[derive(Default)]
pub struct StaticPeerSource {
    peers: Mutex<HashMap<InfoHash, Vec<SocketAddr>>>,
}

impl StaticPeerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, info_hash: InfoHash, addr: SocketAddr) {
        self.peers
            .lock()
            .unwrap()
            .entry(info_hash)
            .or_default()
            .push(addr);
    }
}

#[async_trait]
impl PeerSource for StaticPeerSource {
    async fn next_peers(
        &self,
        info_hash: InfoHash,
        max: usize,
    ) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .unwrap()
            .get(&info_hash)
            .map(|peers| peers.iter().take(max).copied().collect())
            .unwrap_or_default()
    }

    async fn report_failure(&self, info_hash: InfoHash, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peers) = peers.get_mut(&info_hash) {
            if let Some(pos) = peers.iter().position(|p| *p == addr) {
                let failed = peers.remove(pos);
                peers.push(failed);
            }
        }
    }
}
