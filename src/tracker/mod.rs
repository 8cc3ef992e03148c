//! Peer discovery through trackers.
//!
//! The torrent driver only ever talks to [`TrackerList`], which walks the
//! metainfo's announce tiers in preference order and unions the returned
//! peer addresses until it has enough. Whether a given tracker speaks HTTP
//! or UDP is decided here by URL scheme and hidden behind [`Tracker`].

pub(crate) mod http;
pub(crate) mod udp;

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The event field of an announce.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// A routine re-announce.
    None,
    /// The first announce of the download.
    Started,
    /// The download is over and the client is leaving the swarm.
    Stopped,
}

/// The parameters of a single announce, shared by both tracker protocols.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we could accept connections on, as required by the protocol.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// The number of payload bytes still missing.
    pub left: u64,
    pub event: Event,
    /// How many peers we would like to get back.
    pub num_want: u32,
}

/// What a tracker gave us.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct AnnounceResponse {
    /// How long the tracker wants us to wait before the next routine
    /// announce, if it said.
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

/// A single tracker of either protocol.
pub(crate) enum Tracker {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Tracker {
    /// Creates a tracker for the URL, or `None` if the scheme is not
    /// supported.
    pub fn from_url(url: Url) -> Option<Self> {
        match url.scheme() {
            "http" | "https" => Some(Tracker::Http(http::HttpTracker::new(url))),
            "udp" => udp::UdpTracker::new(url).map(Tracker::Udp),
            scheme => {
                log::warn!("Unsupported tracker scheme {:?}", scheme);
                None
            }
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }

    pub async fn announce(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        match self {
            Tracker::Http(t) => t.announce(announce).await,
            Tracker::Udp(t) => t.announce(announce).await,
        }
    }
}

struct TrackerEntry {
    tracker: Tracker,
    /// Consecutive failures. The entry is skipped once this passes the
    /// configured threshold.
    error_count: usize,
}

/// The announce tiers of a torrent, consulted in order.
pub(crate) struct TrackerList {
    tiers: Vec<Vec<TrackerEntry>>,
    error_threshold: usize,
}

impl TrackerList {
    pub fn new(tiers: &[Vec<Url>], error_threshold: usize) -> Self {
        let tiers = tiers
            .iter()
            .map(|tier| {
                tier.iter()
                    .cloned()
                    .filter_map(Tracker::from_url)
                    .map(|tracker| TrackerEntry {
                        tracker,
                        error_count: 0,
                    })
                    .collect()
            })
            .collect();
        Self {
            tiers,
            error_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }

    /// Announces to the torrent's trackers until at least `min_peers` unique
    /// addresses have been collected or every usable tracker has been asked.
    ///
    /// Within a tier trackers are tried in order and a responding tracker is
    /// promoted to the tier's head, so later announces reach it first.
    /// Individual tracker failures are recorded, not propagated; the result
    /// is the union of all successful responses. [`Error::NoPeers`] is
    /// returned only if nothing produced a single address.
    pub async fn announce(
        &mut self,
        announce: &Announce,
        min_peers: usize,
    ) -> Result<AnnounceResponse> {
        let mut peers = HashSet::new();
        let mut interval: Option<Duration> = None;

        for tier in self.tiers.iter_mut() {
            if peers.len() >= min_peers {
                break;
            }
            for i in 0..tier.len() {
                if peers.len() >= min_peers {
                    break;
                }
                if tier[i].error_count >= self.error_threshold {
                    continue;
                }
                log::info!(
                    "Announcing to tracker {} (event {:?})",
                    tier[i].tracker.url(),
                    announce.event
                );
                match tier[i].tracker.announce(announce).await {
                    Ok(response) => {
                        tier[i].error_count = 0;
                        log::info!(
                            "Tracker {} returned {} peers",
                            tier[i].tracker.url(),
                            response.peers.len()
                        );
                        peers.extend(response.peers);
                        interval = match (interval, response.interval) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        // promote the responding tracker to the tier's head
                        tier[..=i].rotate_right(1);
                    }
                    Err(e) => {
                        tier[i].error_count += 1;
                        log::warn!(
                            "Tracker {} announce error ({} so far): {}",
                            tier[i].tracker.url(),
                            tier[i].error_count,
                            e
                        );
                    }
                }
            }
        }

        if peers.is_empty() && announce.event != Event::Stopped {
            return Err(Error::NoPeers);
        }
        Ok(AnnounceResponse {
            interval,
            peers: peers.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_scheme_dispatch() {
        let http = Url::parse("http://tracker.example/announce").unwrap();
        assert!(matches!(Tracker::from_url(http), Some(Tracker::Http(_))));

        let udp = Url::parse("udp://tracker.example:1337").unwrap();
        assert!(matches!(Tracker::from_url(udp), Some(Tracker::Udp(_))));

        let wss = Url::parse("wss://tracker.example").unwrap();
        assert!(Tracker::from_url(wss).is_none());
    }
}
