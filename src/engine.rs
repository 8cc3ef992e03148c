//! The public entry point: download a torrent described by a metainfo into
//! a directory, and return once every byte is verified and on disk.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::{mpsc, RwLock},
};

use crate::{
    conf::{Conf, EngineConf, DEFAULT_PORT_RANGE},
    disk,
    error::{Error, Result},
    metainfo::Metainfo,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentContext},
    tracker::TrackerList,
};

/// What a finished download looked like.
#[derive(Clone, Debug)]
pub struct Summary {
    /// Committed payload bytes.
    pub downloaded: u64,
    /// Bytes received but thrown away: endgame duplicates, corrupt pieces,
    /// protocol noise.
    pub wasted: u64,
    pub piece_count: usize,
    pub elapsed: Duration,
}

/// Downloads the torrent into `conf.torrent.download_dir`.
///
/// This drives the whole pipeline: tracker discovery, peer sessions, piece
/// verification, and the final file writes. It returns when the last piece
/// is committed, or with the first error that makes finishing impossible
/// (unusable metainfo, no reachable peers, a full disk, a piece the swarm
/// cannot produce intact).
pub async fn download(conf: Conf, metainfo: Metainfo) -> Result<Summary> {
    log::info!(
        "Downloading {:?}: {} bytes in {} pieces",
        metainfo.name,
        metainfo.download_len(),
        metainfo.piece_count()
    );

    // The listen port is announced to trackers, so it must genuinely be
    // ours for the whole download, even though this client doesn't serve
    // inbound connections. Keep the listener alive until we return.
    let (_listener, listen_port) = bind_listen_port(&conf.engine).await?;
    log::info!("Listen port is {}", listen_port);

    let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    let (disk_join, disk, disk_alerts) =
        disk::spawn(storage.clone(), metainfo.pieces.clone())?;

    let (events_chan, events_port) = mpsc::unbounded_channel();
    let piece_count = storage.piece_count;
    let ctx = Arc::new(TorrentContext {
        info_hash: metainfo.info_hash,
        client_id: conf.engine.client_id,
        storage,
        conf: conf.torrent.clone(),
        piece_picker: RwLock::new(PiecePicker::new(piece_count)),
        downloads: RwLock::new(HashMap::new()),
        disk,
        events: events_chan,
        peer_ids: RwLock::new(HashSet::new()),
        in_endgame: AtomicBool::new(false),
    });

    let trackers = TrackerList::new(
        &metainfo.trackers,
        conf.torrent.tracker_error_threshold,
    );
    let mut torrent =
        Torrent::new(ctx, trackers, disk_alerts, events_port, listen_port);
    let result = torrent.start().await;

    // wait for the disk task to drain so that a returned summary means the
    // bytes really are in the files
    let _ = disk_join.await;

    result
}

/// Binds the port we announce: the configured one, or the first free port
/// of the standard range.
async fn bind_listen_port(conf: &EngineConf) -> Result<(TcpListener, u16)> {
    if let Some(port) = conf.listen_port {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        return Ok((listener, port));
    }
    for port in DEFAULT_PORT_RANGE {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                log::debug!("Cannot bind port {}: {}", port, e);
            }
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free port in the default listen range",
    )))
}
