// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod counter;
mod disk;
mod download;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
mod storage_info;
mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use engine::{download, Summary};
pub use storage_info::FileInfo;

/// Index of a piece within the torrent.
///
/// The wire encodes piece indices as big endian `u32`s; internally `usize`
/// keeps them usable as slice indices without casts at every site.
pub type PieceIndex = usize;

/// Index of a file within the torrent's flattened file list.
pub type FileIndex = usize;

/// A 20 byte client identifier, exchanged in handshakes and announces.
///
/// The bytes are opaque to the protocol; BEP 20 describes the conventions
/// clients use when generating one.
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest.
pub type Sha1Hash = [u8; 20];

/// Per-piece availability flags, bit `i` standing for piece `i`.
///
/// The order matches the wire encoding of the bitfield message: most
/// significant bit first within each byte, so `0b1000_0010` says the peer
/// has pieces 0 and 6. Set means present, clear means absent.
pub type Bitfield = BitVec<Msb0, u8>;

/// Every transfer happens in blocks of this size (16 KiB), the request
/// granularity peers across the swarm agree on. Only a piece's trailing
/// block may be smaller.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// Identifies one block of the torrent: the piece it belongs to, its byte
/// offset within that piece, and its length. These are exactly the three
/// integers carried by request and cancel messages (and, with the payload
/// appended, by piece messages).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    pub piece_index: PieceIndex,
    /// Byte offset from the start of the piece, always a multiple of
    /// [`BLOCK_LEN`].
    pub offset: u32,
    /// Length in bytes: [`BLOCK_LEN`], or less for a piece's final block.
    pub len: u32,
}

impl BlockInfo {
    /// The position of this block within its piece's block list.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len > 0);
        debug_assert!(self.len <= BLOCK_LEN);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Computes the length of the block at `index` within a piece of
/// `piece_len` bytes: a full [`BLOCK_LEN`] everywhere except the trailing
/// remainder, if the piece doesn't divide evenly.
///
/// # Panics
///
/// Panics when the index refers past the end of the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

/// Computes how many blocks a piece of the given length splits into,
/// a short trailing remainder counting as one more block.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + BLOCK_LEN as usize - 1) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // a piece that ends in a 100 byte remainder after two whole blocks
    const RAGGED_PIECE_LEN: u32 = 2 * BLOCK_LEN + 100;

    #[test]
    fn test_block_len_full_and_tail() {
        assert_eq!(block_len(RAGGED_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 2), 100);

        // no short tail when the piece divides evenly
        assert_eq!(block_len(2 * BLOCK_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(2 * BLOCK_LEN, 1), BLOCK_LEN);

        // a piece smaller than one block is its own single short block
        assert_eq!(block_len(100, 0), 100);
    }

    #[test]
    #[should_panic]
    fn test_block_len_past_piece_end_panics() {
        block_len(2 * BLOCK_LEN, 2);
    }

    #[test]
    fn test_block_count_rounds_up() {
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(BLOCK_LEN), 1);
        assert_eq!(block_count(BLOCK_LEN + 1), 2);
        assert_eq!(block_count(RAGGED_PIECE_LEN), 3);
        assert_eq!(block_count(4 * BLOCK_LEN), 4);
    }

    #[test]
    fn test_block_index_in_piece() {
        let head = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        assert_eq!(head.index_in_piece(), 0);

        let tail = BlockInfo {
            piece_index: 3,
            offset: 2 * BLOCK_LEN,
            len: 100,
        };
        assert_eq!(tail.index_in_piece(), 2);
    }
}
