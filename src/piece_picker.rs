//! Decides which piece a session should download next.
//!
//! The picker keeps a per-piece availability count fed by the bitfields and
//! have messages of connected peers, and hands out the rarest piece the
//! asking peer can serve. It is shared by every session of the torrent, so
//! the counts always reflect the currently connected swarm.

use rand::Rng;

use crate::{
    error::{Error, Result},
    Bitfield, PieceIndex,
};

/// When several pieces tie for the lowest availability, one of this many of
/// them is chosen at random, so that a swarm of clients starting at the same
/// moment doesn't converge on the same piece.
const TIE_BREAK_WINDOW: usize = 4;

/// Availability and pick state of a single piece.
#[derive(Clone, Copy, Debug, Default)]
struct Piece {
    /// How many connected peers have the piece.
    frequency: usize,
    /// Whether a download for the piece exists. Endgame ignores this flag
    /// and joins existing downloads instead.
    is_pending: bool,
}

pub(crate) struct PiecePicker {
    /// The pieces we have verified and committed to disk.
    own_pieces: Bitfield,
    /// How many pieces are not yet in `own_pieces`.
    missing_count: usize,
    /// Availability and pick state of each piece.
    pieces: Vec<Piece>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            missing_count: piece_count,
            pieces: vec![Piece::default(); piece_count],
        }
    }

    /// The pieces this client has, as sent in our bitfield message.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn missing_piece_count(&self) -> usize {
        self.missing_count
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count == 0
    }

    /// Registers a connected peer's full piece availability. Returns whether
    /// the peer has any piece we are still missing.
    ///
    /// The bitfield must already be truncated to the piece count.
    pub fn register_availability(&mut self, pieces: &Bitfield) -> Result<bool> {
        if pieces.len() != self.pieces.len() {
            log::warn!(
                "Bitfield length {} doesn't match piece count {}",
                pieces.len(),
                self.pieces.len()
            );
            return Err(Error::InvalidBitfield);
        }
        let mut interested = false;
        for index in 0..self.pieces.len() {
            if pieces[index] {
                self.pieces[index].frequency += 1;
                if !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers that a peer announced one more piece via a have message.
    /// Returns whether this makes the peer worth being interested in.
    pub fn register_piece_availability(
        &mut self,
        index: PieceIndex,
    ) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        piece.frequency += 1;
        Ok(!self.own_pieces[index])
    }

    /// Removes a disconnecting peer's pieces from the availability counts.
    pub fn unregister_availability(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        for index in 0..self.pieces.len().min(pieces.len()) {
            if pieces[index] {
                debug_assert!(self.pieces[index].frequency > 0);
                self.pieces[index].frequency =
                    self.pieces[index].frequency.saturating_sub(1);
            }
        }
    }

    /// Picks the rarest piece that is available from the given peer and not
    /// already being downloaded, and marks it pending. Equal-rarity
    /// candidates are tied broken by index with a small random window.
    pub fn pick_piece(&mut self, available: &Bitfield) -> Option<PieceIndex> {
        debug_assert_eq!(available.len(), self.pieces.len());

        let mut min_frequency = usize::MAX;
        let mut candidates = Vec::new();
        for (index, piece) in self.pieces.iter().enumerate() {
            if self.own_pieces[index]
                || piece.is_pending
                || piece.frequency == 0
                || !available[index]
            {
                continue;
            }
            if piece.frequency < min_frequency {
                min_frequency = piece.frequency;
                candidates.clear();
            }
            if piece.frequency == min_frequency {
                candidates.push(index);
            }
        }

        if candidates.is_empty() {
            return None;
        }
        let window = candidates.len().min(TIE_BREAK_WINDOW);
        let index = candidates[rand::thread_rng().gen_range(0..window)];
        self.pieces[index].is_pending = true;
        Some(index)
    }

    /// Puts a piece back into the pickable pool after its download was
    /// abandoned or its hash check failed.
    pub fn reset_piece(&mut self, index: PieceIndex) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.is_pending = false;
        }
    }

    /// Records that a piece was verified and committed.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(!self.own_pieces[index]);
        self.own_pieces.set(index, true);
        self.pieces[index].is_pending = false;
        self.missing_count -= 1;
    }

    /// Returns whether the given piece set contains anything we lack.
    pub fn is_interested(&self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.pieces.len());
        (0..self.pieces.len().min(pieces.len()))
            .any(|index| pieces[index] && !self.own_pieces[index])
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PIECE_COUNT: usize = 8;

    fn bitfield(indices: &[PieceIndex]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, PIECE_COUNT);
        for index in indices {
            bitfield.set(*index, true);
        }
        bitfield
    }

    fn all_pieces() -> Bitfield {
        Bitfield::repeat(true, PIECE_COUNT)
    }

    #[test]
    fn test_pick_prefers_rarest() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        // piece 5 is on one peer, everything else on three
        for _ in 0..3 {
            picker.register_availability(&bitfield(&[0, 1, 2, 3, 4, 6, 7])).unwrap();
        }
        picker.register_availability(&bitfield(&[5])).unwrap();

        assert_eq!(picker.pick_piece(&all_pieces()), Some(5));
        // 5 is now pending, so the next pick is among the frequency 3 pool
        let next = picker.pick_piece(&all_pieces()).unwrap();
        assert!(next != 5);
    }

    #[test]
    fn test_pick_restricted_to_peer_availability() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        picker.register_availability(&bitfield(&[2])).unwrap();
        picker.register_availability(&bitfield(&[3, 4])).unwrap();

        // peer only has piece 4, so rarity of piece 2 doesn't matter
        assert_eq!(picker.pick_piece(&bitfield(&[4])), Some(4));
        // nothing left this peer can serve
        assert_eq!(picker.pick_piece(&bitfield(&[4])), None);
    }

    #[test]
    fn test_pick_skips_unavailable_pieces() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        // no peer announced anything: nothing is pickable even if the
        // requesting peer claims the piece
        assert_eq!(picker.pick_piece(&all_pieces()), None);
    }

    #[test]
    fn test_unregister_availability_restores_counts() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        let pieces = bitfield(&[1]);
        picker.register_availability(&pieces).unwrap();
        picker.unregister_availability(&pieces);
        // the sole provider left, so the piece cannot be picked
        assert_eq!(picker.pick_piece(&all_pieces()), None);
    }

    #[test]
    fn test_have_updates_interest() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        assert!(picker.register_piece_availability(3).unwrap());
        assert!(picker.register_piece_availability(8).is_err());

        // once we own the piece, another have for it is not interesting
        picker.pieces[3].is_pending = true;
        picker.received_piece(3);
        assert!(!picker.register_piece_availability(3).unwrap());
    }

    #[test]
    fn test_own_pieces_are_not_picked() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        picker.register_availability(&all_pieces()).unwrap();
        let mut picked = Vec::new();
        while let Some(index) = picker.pick_piece(&all_pieces()) {
            picked.push(index);
            picker.received_piece(index);
        }
        picked.sort_unstable();
        assert_eq!(picked, (0..PIECE_COUNT).collect::<Vec<_>>());
        assert!(picker.is_complete());
        assert_eq!(picker.missing_piece_count(), 0);
        assert!(!picker.is_interested(&all_pieces()));
    }

    #[test]
    fn test_reset_piece_makes_it_pickable_again() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        picker.register_availability(&bitfield(&[6])).unwrap();
        assert_eq!(picker.pick_piece(&all_pieces()), Some(6));
        assert_eq!(picker.pick_piece(&all_pieces()), None);
        picker.reset_piece(6);
        assert_eq!(picker.pick_piece(&all_pieces()), Some(6));
    }

    #[test]
    fn test_wrong_length_bitfield_is_rejected() {
        let mut picker = PiecePicker::new(PIECE_COUNT);
        let short = Bitfield::repeat(true, PIECE_COUNT - 1);
        assert!(matches!(
            picker.register_availability(&short),
            Err(Error::InvalidBitfield)
        ));
    }
}
