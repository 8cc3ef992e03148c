//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::PeerId;

/// The client id prefix announced to trackers and peers, Azureus style. The
/// remaining 12 bytes are filled with random digits per run.
pub const LEECHTORRENT_CLIENT_PREFIX: &[u8; 8] = b"-LE0010-";

/// The inclusive port range we try to bind when no port is pinned.
pub const DEFAULT_PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6889;

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: gen_client_id(),
                listen_port: None,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port announced to trackers. If unset, the first free port in
    /// [`DEFAULT_PORT_RANGE`] is bound.
    pub listen_port: Option<u16>,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// How many unique peer addresses we ask the tracker layer for before it
    /// stops walking the announce tiers.
    pub min_requested_peer_count: usize,

    /// Peer addresses to use in addition to (or instead of) tracker
    /// discovery. Mostly useful for tests and private swarms.
    pub seeds: Vec<SocketAddr>,

    /// If the tracker doesn't provide an announce interval, we default to
    /// this one.
    pub announce_interval: Duration,

    /// After this many failed announces, the torrent stops consulting
    /// a tracker.
    pub tracker_error_threshold: usize,

    /// How long a TCP connect to a peer may take before the dial is abandoned.
    pub connect_timeout: Duration,

    /// The number of block requests a session keeps outstanding to a peer.
    pub request_queue_len: usize,

    /// How long a requested block may be in flight before the request is
    /// cancelled and the block handed to another peer. Halved in endgame.
    pub request_timeout: Duration,

    /// A session that hasn't heard from its peer for this long closes with
    /// a timeout. It doubles as the send side keep-alive deadline.
    pub inactivity_timeout: Duration,

    /// After a choke, blocks requested from the choking peer are reclaimed
    /// only once this grace window has passed, as some clients serve
    /// requests received just before choking.
    pub choke_grace: Duration,

    /// When fewer than this many pieces are missing, sessions start
    /// duplicating in-flight block requests across peers.
    pub endgame_piece_threshold: usize,

    /// A piece failing its hash check this many times aborts the download.
    pub max_piece_retries: usize,

    /// Warmed-up sessions delivering fewer payload bytes per second than
    /// this are closed to make room for better peers.
    pub min_request_rate: f64,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_connected_peer_count: 15,
            // Anything less is a waste of a network round trip; it also lets
            // us buffer up a few more addresses than we can connect at once.
            min_requested_peer_count: 30,
            seeds: Vec::new(),
            announce_interval: Duration::from_secs(30 * 60),
            tracker_error_threshold: 15,
            connect_timeout: Duration::from_secs(10),
            request_queue_len: 5,
            request_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(2 * 60),
            choke_grace: Duration::from_secs(2),
            endgame_piece_threshold: 10,
            max_piece_retries: 5,
            min_request_rate: 1024.0,
        }
    }
}

/// Generates a fresh peer id: the client prefix followed by random ASCII
/// digits.
pub fn gen_client_id() -> PeerId {
    use rand::Rng;

    let mut id = [0; 20];
    id[..8].copy_from_slice(LEECHTORRENT_CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = gen_client_id();
        assert_eq!(&id[..8], LEECHTORRENT_CLIENT_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }
}
