mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        net::SocketAddr,
        sync::{atomic::Ordering, Arc},
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::ThruputRate,
        download::{BlockReceipt, PieceDownload},
        error::{Error, Result},
        torrent::{SessionEvent, TorrentContext},
        Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
};

/// The channel on which the torrent driver sends commands to a session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// A piece was verified and committed: announce it to the peer and
    /// withdraw any of our requests that it made moot.
    PieceCompleted(PieceIndex),
    /// A piece this peer was the sole source of failed its hash check.
    /// The session score takes the hit, so a fast-but-corrupting peer
    /// loses its scheduling priority long before it is banned.
    HashFailure,
    /// Politely wind down the session.
    Shutdown,
}

/// Why a session ended. Reported to the torrent driver on the event channel
/// so that peer termination is data, not a side channel.
#[derive(Debug)]
pub(crate) enum StopReason {
    /// The driver asked the session to stop.
    Shutdown,
    /// The peer closed the connection (or never completed the handshake).
    PeerClosed,
    /// The handshake presented a peer id we're already connected to; the
    /// older session wins.
    DuplicatePeerId,
    /// The peer was too slow for too long and was dropped to make room.
    LowThroughput,
    /// A protocol, timeout, or IO error. The offending error is included.
    Error(Error),
}

pub(crate) struct PeerSession {
    /// Shared state of the torrent this session belongs to.
    torrent: Arc<TorrentContext>,
    /// The port on which the session receives commands from the driver.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session state.
    status: Status,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting; a block not in this list is unsolicited
    /// (which, outside endgame, means it is dropped). The same blocks are
    /// also registered in the torrent's shared download map, with this
    /// session as the requester.
    outgoing_requests: Vec<BlockInfo>,
    /// Delivered payload bytes per second, the session's score.
    rate: ThruputRate,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                peer_info: None,
                outgoing_requests: Vec::new(),
                rate: ThruputRate::default(),
            },
            cmd_chan,
        )
    }

    /// Runs the session until it stops for any reason, then cleans up after
    /// it: in-flight blocks are reverted, the peer's pieces are removed from
    /// the rarity counts, and the driver is told why the session ended.
    pub async fn start(&mut self) {
        log::info!("Starting peer {} session", self.addr);
        let reason = match self.run().await {
            Ok(reason) => reason,
            Err(e) => {
                log::warn!("Peer {} session error: {}", self.addr, e);
                StopReason::Error(e)
            }
        };
        self.cleanup().await;
        let _ = self.torrent.events.send(SessionEvent::Stopped {
            addr: self.addr,
            reason,
        });
    }

    async fn run(&mut self) -> Result<StopReason> {
        let conf = &self.torrent.conf;

        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = time::timeout(
            conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = match time::timeout(
            conf.connect_timeout,
            socket.next(),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)?
        {
            Some(handshake) => handshake?,
            None => return Ok(StopReason::PeerClosed),
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        // A peer id we're already connected to means this is a second
        // connection to the same client; the older session wins. Only after
        // a successful claim does this session leave any footprint in the
        // shared state (which is also what `cleanup` keys off).
        if !self
            .torrent
            .peer_ids
            .write()
            .await
            .insert(peer_handshake.peer_id)
        {
            log::info!(
                "Peer {} is a duplicate connection, closing",
                self.addr
            );
            return Ok(StopReason::DuplicatePeerId);
        }

        self.peer_info = Some(PeerInfo {
            id: peer_handshake.peer_id,
            pieces: Bitfield::repeat(false, self.torrent.storage.piece_count),
        });

        // Now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self. Note that we need to
        // keep the buffer from the original codec as it may contain bytes of
        // any potential message the peer may have sent after the handshake.
        // The largest legal frames are a block message (piece length plus
        // the 9 byte header) and, for torrents with very many pieces,
        // the bitfield message.
        let max_payload_len = (self.torrent.storage.piece_len + 9)
            .max((self.torrent.storage.piece_count as u32 + 7) / 8 + 1);
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(
            old_parts.io,
            PeerCodec::new(max_payload_len),
        );
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        // advertise our own pieces, but only if we have any: an empty
        // bitfield carries no information
        let own_pieces = {
            let piece_picker = self.torrent.piece_picker.read().await;
            if piece_picker.own_pieces().any() {
                Some(piece_picker.own_pieces().clone())
            } else {
                None
            }
        };
        if let Some(own_pieces) = own_pieces {
            log::debug!("Sending bitfield to peer {}", self.addr);
            socket.send(Message::Bitfield(own_pieces)).await?;
        }

        // the bitfield exchange is only valid directly after the handshake
        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        self.run_loop(socket).await
    }

    /// The main session loop: a race between the peer's messages, the
    /// driver's commands, and a once-a-second tick for everything driven by
    /// time (keep-alives, request timeouts, the choke grace window, and
    /// score bookkeeping).
    async fn run_loop(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<StopReason> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut ticker = time::interval(Duration::from_secs(1)).fuse();

        let now = Instant::now();
        self.status.last_incoming = Some(now);
        self.status.last_outgoing = Some(now);

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Ok(StopReason::PeerClosed),
                    };
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr,
                    );
                    self.status.last_incoming = Some(Instant::now());

                    // The bitfield message may only be received directly
                    // after the handshake; a peer with no pieces is allowed
                    // to skip it.
                    if self.status.state == State::AvailabilityExchange {
                        self.status.state = State::Connected;
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                            continue;
                        }
                    }
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.next() => {
                    match cmd {
                        Some(Command::PieceCompleted(index)) => {
                            self.handle_piece_completed(&mut sink, index)
                                .await?;
                        }
                        Some(Command::HashFailure) => {
                            log::warn!(
                                "Peer {} delivered a corrupt piece, \
                                 penalizing score",
                                self.addr
                            );
                            self.rate.penalize();
                        }
                        // a dropped command channel means the driver is gone
                        Some(Command::Shutdown) | None => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            // a parting courtesy so the peer can free our
                            // slot immediately
                            let _ = sink.send(Message::NotInterested).await;
                            return Ok(StopReason::Shutdown);
                        }
                    }
                }
                _ = ticker.select_next_some() => {
                    if let Some(reason) = self.tick(&mut sink).await? {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    /// Handles the bitfield message sent directly after the handshake.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        let piece_count = self.torrent.storage.piece_count;
        // The bitfield raw data on the wire is padded to a byte boundary.
        // Anything but zeroes in the padding, or a wrong byte count, is
        // a protocol violation.
        if bitfield.len() != (piece_count + 7) / 8 * 8 {
            return Err(Error::InvalidBitfield);
        }
        if (piece_count..bitfield.len()).any(|i| bitfield[i]) {
            log::warn!("Peer {} bitfield has non-zero spare bits", self.addr);
            return Err(Error::InvalidBitfield);
        }
        bitfield.resize(piece_count, false);

        // register the peer's pieces with the piece picker
        let is_interested = self
            .torrent
            .piece_picker
            .write()
            .await
            .register_availability(&bitfield)?;
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = bitfield;
        }

        if is_interested {
            self.become_interested(sink).await?;
        }
        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // our outstanding requests may or may not be honoured
                    // now; they are reclaimed after a grace window in `tick`
                    self.status.choked_at = Some(Instant::now());
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.status.choked_at = None;
                    // now that we are allowed to request blocks, fill the
                    // download pipeline
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            // We never unchoke anyone (there is no upload path), so
            // a request is something the peer shouldn't have sent. Ignoring
            // it is all the choking we can do.
            Message::Request(block) => {
                log::debug!(
                    "Peer {} requested {:?} while choked, ignoring",
                    self.addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::debug!(
                    "Peer {} cancelled {:?}, nothing to do",
                    self.addr,
                    block
                );
            }
        }
        Ok(())
    }

    /// Registers a piece the peer announced via a have message.
    async fn handle_have_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        piece_index: PieceIndex,
    ) -> Result<()> {
        if piece_index >= self.torrent.storage.piece_count {
            log::warn!(
                "Peer {} sent have with invalid piece {}",
                self.addr,
                piece_index
            );
            return Err(Error::InvalidPieceIndex);
        }

        let already_known = self
            .peer_info
            .as_ref()
            .map(|p| p.pieces[piece_index])
            .unwrap_or(false);
        if already_known {
            return Ok(());
        }
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces.set(piece_index, true);
        }

        let is_interesting = self
            .torrent
            .piece_picker
            .write()
            .await
            .register_piece_availability(piece_index)?;
        if is_interesting && !self.status.is_interested {
            self.become_interested(sink).await?;
        }
        Ok(())
    }

    /// Verifies block validity, hands the bytes to the disk task, and
    /// updates the session score.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Received block from peer {}: {:?}", self.addr, block_info);

        let was_solicited = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => {
                self.outgoing_requests.remove(pos);
                true
            }
            None => false,
        };
        // Outside endgame an unsolicited block is dropped: accepting blocks
        // we never asked for would let a peer spray us with garbage. During
        // endgame a block we cancelled moments ago may still arrive and is
        // worth keeping if the piece still needs it.
        if !was_solicited && !self.is_endgame() {
            log::warn!(
                "Peer {} sent not requested block: {:?}",
                self.addr,
                block_info,
            );
            return Ok(());
        }

        let receipt = {
            let downloads = self.torrent.downloads.read().await;
            match downloads.get(&block_info.piece_index) {
                Some(download) => {
                    let mut download = download.write().await;
                    if download.block_index(&block_info).is_none() {
                        return Err(Error::InvalidBlock);
                    }
                    Some(download.received_block(&block_info))
                }
                // the piece is no longer being downloaded (it was committed
                // or reset); the bytes are useless
                None => None,
            }
        };

        match receipt {
            Some(BlockReceipt::Accepted) => {
                self.rate.record(block_info.len);
                // hand off to the disk task, with provenance for the case
                // the piece turns out corrupt
                self.torrent.disk.write_block(
                    block_info,
                    data,
                    self.addr,
                )?;
            }
            Some(BlockReceipt::AlreadyReceived) | None => {
                log::debug!(
                    "Discarding redundant block {:?} from peer {}",
                    block_info,
                    self.addr
                );
            }
        }
        Ok(())
    }

    /// Fills the session's download pipeline up to the configured number of
    /// outstanding requests: first by continuing piece downloads this or
    /// other sessions started, then by picking fresh pieces, and in endgame
    /// by duplicating other sessions' in-flight blocks.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let pieces = match &self.peer_info {
            Some(peer_info) => peer_info.pieces.clone(),
            None => return Ok(()),
        };
        let queue_len = self.torrent.conf.request_queue_len;

        let mut to_request = Vec::new();
        let budget = |outgoing: &Vec<BlockInfo>, new: &Vec<BlockInfo>| {
            queue_len.saturating_sub(outgoing.len() + new.len())
        };

        // If there are active downloads the peer can serve, prefer to
        // continue those: fewer in-progress pieces means pieces complete
        // (and free their buffers) sooner.
        {
            let downloads = self.torrent.downloads.read().await;
            for download in downloads.values() {
                let count = budget(&self.outgoing_requests, &to_request);
                if count == 0 {
                    break;
                }
                let mut download = download.write().await;
                if !pieces[download.piece_index()] {
                    continue;
                }
                download.pick_blocks(count, self.addr, &mut to_request);
            }
        }

        // while there is budget left, start new piece downloads
        loop {
            let count = budget(&self.outgoing_requests, &to_request);
            if count == 0 {
                break;
            }
            let index = self
                .torrent
                .piece_picker
                .write()
                .await
                .pick_piece(&pieces);
            let index = match index {
                Some(index) => index,
                None => break,
            };
            log::info!("Session {} starting piece {} download", self.addr, index);

            let mut download =
                PieceDownload::new(index, self.torrent.storage.piece_len(index)?);
            download.pick_blocks(count, self.addr, &mut to_request);
            self.torrent
                .downloads
                .write()
                .await
                .insert(index, tokio::sync::RwLock::new(download));
        }

        // in endgame, double up on other sessions' outstanding blocks; the
        // first response wins and the rest are cancelled
        if self.is_endgame() {
            let downloads = self.torrent.downloads.read().await;
            for download in downloads.values() {
                let count = budget(&self.outgoing_requests, &to_request);
                if count == 0 {
                    break;
                }
                let mut download = download.write().await;
                if !pieces[download.piece_index()] {
                    continue;
                }
                download.pick_duplicate_blocks(
                    count,
                    self.addr,
                    &mut to_request,
                );
            }
        }

        if to_request.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Requesting {} block(s) from peer {}",
            to_request.len(),
            self.addr
        );
        self.outgoing_requests.extend_from_slice(&to_request);
        for block in to_request {
            sink.send(Message::Request(block)).await?;
        }
        self.status.last_outgoing = Some(Instant::now());
        Ok(())
    }

    /// Reacts to a piece commit: announces it to the peer, withdraws our
    /// requests for it, and drops interest if the peer has nothing left for
    /// us.
    async fn handle_piece_completed(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        index: PieceIndex,
    ) -> Result<()> {
        sink.send(Message::Have { piece_index: index }).await?;

        let moot: Vec<_> = self
            .outgoing_requests
            .iter()
            .filter(|b| b.piece_index == index)
            .copied()
            .collect();
        if !moot.is_empty() {
            self.outgoing_requests.retain(|b| b.piece_index != index);
            for block in moot {
                sink.send(Message::Cancel(block)).await?;
            }
        }

        if self.status.is_interested {
            let still_interested = match &self.peer_info {
                Some(peer_info) => self
                    .torrent
                    .piece_picker
                    .read()
                    .await
                    .is_interested(&peer_info.pieces),
                None => false,
            };
            if !still_interested {
                log::info!("No longer interested in peer {}", self.addr);
                self.status.is_interested = false;
                sink.send(Message::NotInterested).await?;
            }
        }
        self.status.last_outgoing = Some(Instant::now());
        Ok(())
    }

    /// The once-a-second housekeeping pass.
    async fn tick(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<Option<StopReason>> {
        let now = Instant::now();
        let inactivity_timeout = self.torrent.conf.inactivity_timeout;
        let choke_grace = self.torrent.conf.choke_grace;
        let min_request_rate = self.torrent.conf.min_request_rate;

        // a silent peer is a dead peer
        if let Some(last) = self.status.last_incoming {
            if now.duration_since(last) >= inactivity_timeout {
                return Err(Error::InactivityTimeout);
            }
        }

        // reclaim requests a choking peer is presumably never going to honour
        if let Some(choked_at) = self.status.choked_at {
            if now.duration_since(choked_at) >= choke_grace
                && !self.outgoing_requests.is_empty()
            {
                log::debug!(
                    "Peer {} choke grace expired, freeing {} request(s)",
                    self.addr,
                    self.outgoing_requests.len()
                );
                self.free_outstanding_requests().await;
            }
        }

        self.reap_requests(sink, now).await?;

        // keep-alive after prolonged send silence
        if let Some(last) = self.status.last_outgoing {
            if now.duration_since(last) >= inactivity_timeout {
                log::debug!("Sending keep alive to peer {}", self.addr);
                sink.send(Message::KeepAlive).await?;
                self.status.last_outgoing = Some(now);
            }
        }

        self.rate.tick();
        if self.rate.is_warmed_up()
            && self.status.is_interested
            && !self.status.is_choked
            && self.rate.avg() < min_request_rate
        {
            log::info!(
                "Peer {} throughput {:.0} B/s below floor",
                self.addr,
                self.rate.avg()
            );
            return Ok(Some(StopReason::LowThroughput));
        }

        // the safety net: whatever the message flow missed, top up here
        self.make_requests(sink).await?;
        Ok(None)
    }

    /// Walks our outstanding requests and drops the ones that are no longer
    /// going anywhere: timed out requests (with a score penalty and
    /// a best-effort cancel), blocks other sessions have completed in the
    /// meantime, and requests whose piece download is gone entirely.
    async fn reap_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        now: Instant,
    ) -> Result<()> {
        let request_timeout = if self.is_endgame() {
            self.torrent.conf.request_timeout / 2
        } else {
            self.torrent.conf.request_timeout
        };

        let mut kept = Vec::with_capacity(self.outgoing_requests.len());
        let mut cancels = Vec::new();
        let mut timed_out_count = 0;
        {
            let downloads = self.torrent.downloads.read().await;
            for block in self.outgoing_requests.drain(..) {
                let download = match downloads.get(&block.piece_index) {
                    Some(download) => download,
                    // the piece was committed or reset; nothing to cancel
                    None => continue,
                };
                let mut download = download.write().await;
                if download.is_block_received(&block) {
                    // someone else was faster (endgame); withdraw our copy
                    cancels.push(block);
                    continue;
                }
                match download.requested_at(self.addr, &block) {
                    Some(since)
                        if now.duration_since(since) >= request_timeout =>
                    {
                        log::warn!(
                            "Request for {:?} to peer {} timed out",
                            block,
                            self.addr
                        );
                        download.cancel_request(self.addr, &block);
                        cancels.push(block);
                        timed_out_count += 1;
                    }
                    Some(_) => kept.push(block),
                    // the request was reclaimed behind our back
                    None => {}
                }
            }
        }
        self.outgoing_requests = kept;

        if timed_out_count > 0 {
            self.rate.penalize();
        }
        for block in cancels {
            sink.send(Message::Cancel(block)).await?;
            self.status.last_outgoing = Some(Instant::now());
        }
        Ok(())
    }

    async fn become_interested(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        debug_assert!(!self.status.is_interested);
        log::info!("Interested in peer {}", self.addr);
        self.status.is_interested = true;
        sink.send(Message::Interested).await?;
        self.status.last_outgoing = Some(Instant::now());
        Ok(())
    }

    /// Reverts every in-flight block of this session to free so other
    /// sessions can pick them up.
    async fn free_outstanding_requests(&mut self) {
        let downloads = self.torrent.downloads.read().await;
        for download in downloads.values() {
            download.write().await.free_blocks_of(self.addr);
        }
        self.outgoing_requests.clear();
    }

    /// Undoes the session's footprint in the shared state. Runs on every
    /// exit path. A session that never got past the handshake (or lost the
    /// duplicate-id race) has no footprint and nothing happens.
    async fn cleanup(&mut self) {
        self.free_outstanding_requests().await;
        if let Some(peer_info) = &self.peer_info {
            self.torrent
                .piece_picker
                .write()
                .await
                .unregister_availability(&peer_info.pieces);
            self.torrent.peer_ids.write().await.remove(&peer_info.id);
        }
        self.status.state = State::Disconnected;
    }

    fn is_endgame(&self) -> bool {
        self.torrent.in_endgame.load(Ordering::Relaxed)
    }
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    /// This client never uploads, so the flag never changes.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces we have.
    is_peer_interested: bool,
    /// When the peer last choked us, for the request reclaim grace window.
    choked_at: Option<Instant>,
    /// When we last heard anything from the peer.
    last_incoming: Option<Instant>,
    /// When we last sent anything to the peer.
    last_outgoing: Option<Instant>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            choked_at: None,
            last_incoming: None,
            last_outgoing: None,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The window directly after the handshake in which a bitfield message
    /// is valid. Left on the first message of any kind.
    AvailabilityExchange,
    /// The normal state of a peer session, in which any message apart from
    /// the handshake and the bitfield may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id. Used for duplicate connection
    /// detection, not otherwise validated.
    id: PeerId,
    /// All pieces the peer has, updated as bitfield and have messages
    /// arrive.
    pieces: Bitfield,
}
