//! Bookkeeping of a single piece download at block granularity.
//!
//! A [`PieceDownload`] is shared by every session that contributes blocks to
//! the piece. Each block records who requested it and when, which is what
//! makes request timeouts, choke reclaim, and endgame duplication decidable
//! without a central ledger.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

/// A single outstanding request for a block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BlockRequest {
    /// The session (keyed by remote address) that sent the request.
    pub peer: SocketAddr,
    /// When the request was put on the wire.
    pub since: Instant,
}

/// The download state of a single block.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BlockState {
    /// No request for the block is outstanding.
    Free,
    /// The block has been requested from the listed peers. Outside endgame
    /// the list has exactly one entry; during endgame the same block may be
    /// in flight to several peers at once.
    Requested(Vec<BlockRequest>),
    /// The block's bytes have arrived and were handed to the disk task.
    Received,
}

/// What happened to an arriving block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BlockReceipt {
    /// First arrival; the block is now received.
    Accepted,
    /// Another peer delivered this block first. The bytes are redundant.
    AlreadyReceived,
}

pub(crate) struct PieceDownload {
    /// The piece's index in the torrent.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The state of each of the piece's blocks.
    blocks: Vec<BlockState>,
    /// How many blocks are in `Received`.
    received_count: usize,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockState::Free; block_count(len)],
            received_count: 0,
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` free blocks for the peer, lowest offset first,
    /// and appends them to `blocks`. The picked blocks become requested.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        blocks: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for i in 0..self.blocks.len() {
            if picked == count {
                break;
            }
            if let BlockState::Free = self.blocks[i] {
                let info = self.block_info(i);
                self.blocks[i] = BlockState::Requested(vec![BlockRequest {
                    peer,
                    since: Instant::now(),
                }]);
                blocks.push(info);
                picked += 1;
            }
        }
    }

    /// Endgame variant of [`Self::pick_blocks`]: also picks blocks that are
    /// already in flight to _other_ peers, so that the slowest peer of the
    /// swarm doesn't get to drag out the last pieces alone.
    pub fn pick_duplicate_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        blocks: &mut Vec<BlockInfo>,
    ) {
        let mut picked = 0;
        for i in 0..self.blocks.len() {
            if picked == count {
                break;
            }
            let info = self.block_info(i);
            match &mut self.blocks[i] {
                block @ BlockState::Free => {
                    *block = BlockState::Requested(vec![BlockRequest {
                        peer,
                        since: Instant::now(),
                    }]);
                    blocks.push(info);
                    picked += 1;
                }
                BlockState::Requested(requests) => {
                    if requests.iter().all(|r| r.peer != peer) {
                        requests.push(BlockRequest {
                            peer,
                            since: Instant::now(),
                        });
                        blocks.push(info);
                        picked += 1;
                    }
                }
                BlockState::Received => {}
            }
        }
    }

    /// Marks a block as received, regardless of which peers it was requested
    /// from. Returns whether the arrival was the first one.
    pub fn received_block(&mut self, block: &BlockInfo) -> BlockReceipt {
        // the caller validates the block against the piece geometry first
        let index = self
            .block_index(block)
            .expect("received block does not map to piece");
        match self.blocks[index] {
            BlockState::Received => BlockReceipt::AlreadyReceived,
            _ => {
                self.blocks[index] = BlockState::Received;
                self.received_count += 1;
                BlockReceipt::Accepted
            }
        }
    }

    /// Removes the peer's request entry for the block, freeing the block if
    /// no other peer has it in flight. Returns whether an entry was removed.
    /// Received blocks are left alone.
    pub fn cancel_request(&mut self, peer: SocketAddr, block: &BlockInfo) -> bool {
        let index = match self.block_index(block) {
            Some(index) => index,
            None => return false,
        };
        if let BlockState::Requested(requests) = &mut self.blocks[index] {
            let before = requests.len();
            requests.retain(|r| r.peer != peer);
            let removed = requests.len() < before;
            if requests.is_empty() {
                self.blocks[index] = BlockState::Free;
            }
            removed
        } else {
            false
        }
    }

    /// Removes every request entry of the peer, used when a session ends or
    /// its peer choked us for good. Blocks without remaining requesters
    /// become free again.
    pub fn free_blocks_of(&mut self, peer: SocketAddr) -> usize {
        let mut freed = 0;
        for block in self.blocks.iter_mut() {
            if let BlockState::Requested(requests) = block {
                let before = requests.len();
                requests.retain(|r| r.peer != peer);
                if requests.len() < before {
                    freed += 1;
                }
                if requests.is_empty() {
                    *block = BlockState::Free;
                }
            }
        }
        freed
    }

    /// Returns when the peer requested the block, if that request is still
    /// outstanding.
    pub fn requested_at(
        &self,
        peer: SocketAddr,
        block: &BlockInfo,
    ) -> Option<Instant> {
        let index = self.block_index(block)?;
        if let BlockState::Requested(requests) = &self.blocks[index] {
            requests.iter().find(|r| r.peer == peer).map(|r| r.since)
        } else {
            None
        }
    }

    pub fn is_block_received(&self, block: &BlockInfo) -> bool {
        self.block_index(block)
            .map(|i| self.blocks[i] == BlockState::Received)
            .unwrap_or(false)
    }

    /// Returns the requests of peers that are not in `live` and are older
    /// than `age`. The torrent uses this as a safety net against blocks
    /// orphaned by sessions that could not clean up after themselves.
    pub fn stale_requests(
        &self,
        live: &dyn Fn(SocketAddr) -> bool,
        age: Duration,
    ) -> Vec<(BlockInfo, SocketAddr)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            if let BlockState::Requested(requests) = block {
                for request in requests {
                    if !live(request.peer)
                        && now.duration_since(request.since) >= age
                    {
                        stale.push((self.block_info(i), request.peer));
                    }
                }
            }
        }
        stale
    }

    pub fn count_missing_blocks(&self) -> usize {
        self.blocks.len() - self.received_count
    }

    pub fn has_free_blocks(&self) -> bool {
        self.blocks.iter().any(|b| *b == BlockState::Free)
    }

    /// Maps a wire level block triple onto the index of the block within
    /// this piece, or `None` if the triple doesn't lie on a valid block
    /// boundary of the piece.
    pub fn block_index(&self, block: &BlockInfo) -> Option<usize> {
        if block.piece_index != self.index
            || block.offset % BLOCK_LEN != 0
            || block.len == 0
        {
            return None;
        }
        let index = (block.offset / BLOCK_LEN) as usize;
        if index >= self.blocks.len() || block.len != block_len(self.len, index)
        {
            return None;
        }
        Some(index)
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.len, block_index),
        }
    }
}
