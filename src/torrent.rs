//! The torrent driver: the task that owns peer discovery, the session
//! table, and the reaction to disk verdicts.
//!
//! Sessions do most scheduling themselves against the shared picker and
//! download map; the driver supplies them with addresses, broadcasts piece
//! commits, reclaims what crashed sessions leave behind, and decides when
//! the download is over (or hopeless).

use {
    futures::{select, stream::Fuse, StreamExt},
    std::{
        collections::{HashMap, HashSet, VecDeque},
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::{
        sync::{
            mpsc::{UnboundedReceiver, UnboundedSender},
            RwLock,
        },
        task, time,
    },
};

use crate::{
    conf::TorrentConf,
    disk::{Alert as DiskAlert, AlertReceiver as DiskAlertReceiver, DiskHandle},
    download::PieceDownload,
    engine::Summary,
    error::{Error, Result},
    peer::{self, PeerSession, StopReason},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker::{Announce, Event, TrackerList},
    PeerId, PieceIndex, Sha1Hash,
};

/// A peer whose blocks corrupted this many pieces is banned for the rest of
/// the session.
const MAX_HASH_STRIKES: usize = 5;

/// How long the driver waits between dry announces when it has run out of
/// peers entirely.
const DRY_ANNOUNCE_COOLDOWN: Duration = Duration::from_secs(30);

/// State of the torrent shared with every session (and through them, the
/// disk task). Mutable parts are individually locked; sessions and driver
/// never hold more than one of the outer locks at a time.
pub(crate) struct TorrentContext {
    pub info_hash: Sha1Hash,
    /// The id we present to trackers and peers.
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
    /// The piece picker: rarity counts and our own piece set.
    pub piece_picker: RwLock<PiecePicker>,
    /// The active piece downloads, keyed by piece index. Sessions of the
    /// same piece share one entry.
    pub downloads: RwLock<HashMap<PieceIndex, RwLock<PieceDownload>>>,
    /// The channel to the disk task.
    pub disk: DiskHandle,
    /// Where sessions report their termination.
    pub events: UnboundedSender<SessionEvent>,
    /// The ids of currently connected peers. A handshake claiming an id
    /// that is already connected is a duplicate connection and the newer
    /// session closes itself.
    pub peer_ids: RwLock<HashSet<PeerId>>,
    /// Set once the number of missing pieces drops below the endgame
    /// threshold; sessions then start duplicating in-flight requests.
    pub in_endgame: AtomicBool,
}

/// What sessions report to the driver.
pub(crate) enum SessionEvent {
    /// The session ended. Its in-flight blocks and availability counts have
    /// already been reverted by the session itself.
    Stopped {
        addr: SocketAddr,
        reason: StopReason,
    },
}

struct PeerHandle {
    cmd: peer::Sender,
    join: task::JoinHandle<()>,
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    /// The port we announce to trackers.
    listen_port: u16,
    trackers: TrackerList,
    disk_alerts: Fuse<DiskAlertReceiver>,
    events: Fuse<UnboundedReceiver<SessionEvent>>,
    /// The currently connected (or connecting) sessions.
    peers: HashMap<SocketAddr, PeerHandle>,
    /// Discovered addresses not yet dialed.
    available_addrs: VecDeque<SocketAddr>,
    /// Every address ever discovered, to dedupe tracker responses (and to
    /// never dial the same peer twice concurrently).
    known_addrs: HashSet<SocketAddr>,
    /// Addresses that are not dialed again this session.
    banned_addrs: HashSet<SocketAddr>,
    /// Hash failure strikes per address.
    strikes: HashMap<SocketAddr, usize>,
    /// Verification failures per piece.
    piece_retries: HashMap<PieceIndex, usize>,
    /// Committed payload bytes.
    downloaded: u64,
    /// Redundant or rejected bytes, for the final summary.
    wasted: u64,
    /// When the next routine announce is due.
    next_announce: Instant,
    /// When we last talked to a tracker at all.
    last_announce: Option<Instant>,
}

impl Torrent {
    pub fn new(
        ctx: Arc<TorrentContext>,
        trackers: TrackerList,
        disk_alerts: DiskAlertReceiver,
        events: UnboundedReceiver<SessionEvent>,
        listen_port: u16,
    ) -> Self {
        let mut torrent = Self {
            ctx,
            listen_port,
            trackers,
            disk_alerts: disk_alerts.fuse(),
            events: events.fuse(),
            peers: HashMap::new(),
            available_addrs: VecDeque::new(),
            known_addrs: HashSet::new(),
            banned_addrs: HashSet::new(),
            strikes: HashMap::new(),
            piece_retries: HashMap::new(),
            downloaded: 0,
            wasted: 0,
            next_announce: Instant::now(),
            last_announce: None,
        };
        let seeds = torrent.ctx.conf.seeds.clone();
        for addr in seeds {
            torrent.enqueue_addr(addr);
        }
        torrent
    }

    /// Drives the download to completion. Returns when every piece is
    /// committed, or with the error that made the download impossible.
    /// Either way the swarm is left cleanly: sessions are wound down and
    /// the tracker gets its `stopped` event.
    pub async fn start(&mut self) -> Result<Summary> {
        let start_time = Instant::now();
        log::info!(
            "Starting torrent ({} pieces, {} bytes)",
            self.ctx.storage.piece_count,
            self.ctx.storage.download_len
        );

        let result = match self.announce(Event::Started).await {
            Ok(()) => {
                self.connect_to_peers();
                self.run().await
            }
            Err(e) => Err(e),
        };

        self.shutdown().await;

        result.map(|()| Summary {
            downloaded: self.downloaded,
            wasted: self.wasted,
            piece_count: self.ctx.storage.piece_count,
            elapsed: start_time.elapsed(),
        })
    }

    async fn run(&mut self) -> Result<()> {
        let mut ticker = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                alert = self.disk_alerts.next() => {
                    let alert = alert.ok_or(Error::Channel)?;
                    if self.handle_disk_alert(alert).await? {
                        return Ok(());
                    }
                }
                event = self.events.next() => {
                    let event = event.ok_or(Error::Channel)?;
                    self.handle_session_event(event);
                }
                _ = ticker.select_next_some() => {
                    self.tick().await?;
                }
            }
        }
    }

    /// Reacts to a disk verdict. Returns true when the download is
    /// complete.
    async fn handle_disk_alert(&mut self, alert: DiskAlert) -> Result<bool> {
        match alert {
            DiskAlert::PieceCompleted { index } => {
                let piece_len = self.ctx.storage.piece_len(index)?;
                self.downloaded += u64::from(piece_len);
                self.piece_retries.remove(&index);

                self.ctx.piece_picker.write().await.received_piece(index);
                self.ctx.downloads.write().await.remove(&index);

                // every live session tells its peer about the new piece
                for peer in self.peers.values() {
                    let _ = peer
                        .cmd
                        .send(peer::Command::PieceCompleted(index));
                }

                let missing = self
                    .ctx
                    .piece_picker
                    .read()
                    .await
                    .missing_piece_count();
                log::info!(
                    "Piece {} committed, {} to go",
                    index,
                    missing
                );
                if missing == 0 {
                    log::info!("Download complete");
                    return Ok(true);
                }
                self.maybe_enter_endgame().await;
                Ok(false)
            }
            DiskAlert::PieceRejected {
                index,
                contributors,
            } => {
                let retries = self.piece_retries.entry(index).or_insert(0);
                *retries += 1;
                log::warn!(
                    "Piece {} rejected (failure {}), contributors: {:?}",
                    index,
                    retries,
                    contributors
                );
                if *retries >= self.ctx.conf.max_piece_retries {
                    return Err(Error::PieceUnrecoverable(index));
                }

                // every block of the piece goes back into the pool
                self.ctx.downloads.write().await.remove(&index);
                self.ctx.piece_picker.write().await.reset_piece(index);

                // with one contributor there is no doubt who is at fault:
                // its session score drops immediately, and enough strikes
                // ban the address outright
                if let [addr] = contributors[..] {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.cmd.send(peer::Command::HashFailure);
                    }
                    self.strike_peer(addr);
                }
                Ok(false)
            }
            DiskAlert::DiscardedBlock { len } => {
                self.wasted += u64::from(len);
                Ok(false)
            }
            DiskAlert::WriteFailure(e) => {
                log::error!("Unrecoverable disk failure: {}", e);
                Err(e)
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Stopped { addr, reason } => {
                log::info!("Peer {} session stopped: {:?}", addr, reason);
                self.peers.remove(&addr);
            }
        }
    }

    /// Records a hash failure against a peer and bans it once it has used
    /// up its strikes.
    fn strike_peer(&mut self, addr: SocketAddr) {
        let strikes = self.strikes.entry(addr).or_insert(0);
        *strikes += 1;
        log::warn!("Peer {} hash strike {}", addr, strikes);
        if *strikes >= MAX_HASH_STRIKES {
            log::warn!("Banning peer {} for repeated corruption", addr);
            self.banned_addrs.insert(addr);
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer.cmd.send(peer::Command::Shutdown);
            }
        }
    }

    /// The once-a-second housekeeping pass: endgame entry, reclaiming
    /// blocks orphaned by dead sessions, periodic announces, and dialing
    /// new peers.
    async fn tick(&mut self) -> Result<()> {
        self.maybe_enter_endgame().await;
        self.reclaim_orphaned_blocks().await;

        let now = Instant::now();
        let announce_due = now >= self.next_announce;
        // when the swarm has dried up entirely, don't wait out the full
        // tracker interval
        let dry = self.peers.is_empty() && self.available_addrs.is_empty();
        let cooldown_over = self
            .last_announce
            .map(|at| now.duration_since(at) >= DRY_ANNOUNCE_COOLDOWN)
            .unwrap_or(true);
        if announce_due || (dry && cooldown_over) {
            // a dry routine announce is not fatal; the next tick retries
            if let Err(e) = self.announce(Event::None).await {
                log::warn!("Routine announce failed: {}", e);
            }
        }

        self.connect_to_peers();
        Ok(())
    }

    /// Flips the endgame switch once few enough pieces are missing.
    async fn maybe_enter_endgame(&mut self) {
        if self.ctx.in_endgame.load(Ordering::Relaxed) {
            return;
        }
        let missing =
            self.ctx.piece_picker.read().await.missing_piece_count();
        if missing > 0 && missing <= self.ctx.conf.endgame_piece_threshold {
            log::info!("Entering endgame, {} piece(s) missing", missing);
            self.ctx.in_endgame.store(true, Ordering::Relaxed);
        }
    }

    /// The safety net behind session self-cleanup: any block still marked
    /// in-flight to a session that no longer exists is freed, once it is
    /// old enough to be past the choke grace window.
    async fn reclaim_orphaned_blocks(&mut self) {
        let live: HashSet<SocketAddr> = self.peers.keys().copied().collect();
        let grace = self.ctx.conf.choke_grace;
        let downloads = self.ctx.downloads.read().await;
        for download in downloads.values() {
            let stale = {
                let download = download.read().await;
                download.stale_requests(&|addr| live.contains(&addr), grace)
            };
            if stale.is_empty() {
                continue;
            }
            let mut download = download.write().await;
            for (block, addr) in stale {
                log::debug!(
                    "Reclaiming orphaned block {:?} of dead peer {}",
                    block,
                    addr
                );
                download.cancel_request(addr, &block);
            }
        }
    }

    /// Talks to the trackers (or, without any, to the configured seed
    /// list). Fails with [`Error::NoPeers`] only when a `started` announce
    /// leaves us with no address to dial at all.
    async fn announce(&mut self, event: Event) -> Result<()> {
        self.last_announce = Some(Instant::now());
        let is_started = event == Event::Started;

        if self.trackers.is_empty() {
            // nothing to consult; don't retry every tick
            self.next_announce = Instant::now() + self.ctx.conf.announce_interval;
        } else {
            let announce = Announce {
                info_hash: self.ctx.info_hash,
                peer_id: self.ctx.client_id,
                port: self.listen_port,
                uploaded: 0,
                downloaded: self.downloaded,
                left: self
                    .ctx
                    .storage
                    .download_len
                    .saturating_sub(self.downloaded),
                event,
                num_want: self.ctx.conf.min_requested_peer_count as u32,
            };
            match self
                .trackers
                .announce(
                    &announce,
                    self.ctx.conf.min_requested_peer_count,
                )
                .await
            {
                Ok(response) => {
                    let interval = response
                        .interval
                        .unwrap_or(self.ctx.conf.announce_interval);
                    self.next_announce = Instant::now() + interval;
                    for addr in response.peers {
                        self.enqueue_addr(addr);
                    }
                }
                Err(e) => {
                    log::warn!("Announce round failed: {}", e);
                    self.next_announce =
                        Instant::now() + DRY_ANNOUNCE_COOLDOWN;
                }
            }
        }

        let nothing_to_dial = self.peers.is_empty()
            && self.available_addrs.is_empty();
        if is_started && nothing_to_dial {
            return Err(Error::NoPeers);
        }
        Ok(())
    }

    fn enqueue_addr(&mut self, addr: SocketAddr) {
        if self.banned_addrs.contains(&addr) {
            return;
        }
        if self.known_addrs.insert(addr) {
            self.available_addrs.push_back(addr);
        }
    }

    /// Dials discovered addresses until the peer limit is reached.
    fn connect_to_peers(&mut self) {
        while self.peers.len() < self.ctx.conf.max_connected_peer_count {
            let addr = match self.available_addrs.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            if self.banned_addrs.contains(&addr) {
                continue;
            }
            log::info!("Dialing peer {}", addr);
            let (mut session, cmd) =
                PeerSession::outbound(Arc::clone(&self.ctx), addr);
            let join = task::spawn(async move { session.start().await });
            self.peers.insert(addr, PeerHandle { cmd, join });
        }
    }

    /// Winds the swarm down: sessions close cleanly, the tracker hears
    /// `stopped`, the disk task drains its queue and exits.
    async fn shutdown(&mut self) {
        log::info!("Shutting down torrent");
        let peers: Vec<_> = self.peers.drain().collect();
        for (_, peer) in peers.iter() {
            let _ = peer.cmd.send(peer::Command::Shutdown);
        }
        for (addr, peer) in peers {
            if time::timeout(Duration::from_secs(5), peer.join)
                .await
                .is_err()
            {
                log::warn!("Peer {} session didn't stop in time", addr);
            }
        }

        if let Err(e) = self.announce(Event::Stopped).await {
            log::warn!("Stopped announce failed: {}", e);
        }
        let _ = self.ctx.disk.shutdown();
    }
}
