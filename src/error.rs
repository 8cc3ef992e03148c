//! The error and result types used throughout the crate.

use std::{fmt, io};

use crate::PieceIndex;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by the engine and its parts.
///
/// Recoverable failures (a single misbehaving peer, a tracker that doesn't
/// answer) are absorbed where they occur and only logged; the variants here
/// are the ones that either end a peer session or abort the whole download.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo could not be decoded as bencode.
    Bencode(serde_bencode::Error),
    /// The metainfo decoded but its contents are inconsistent or unusable.
    /// The message names the offending field.
    InvalidMetainfo(&'static str),
    /// An IO failure. When surfaced from [`crate::engine::download`] this is
    /// a resource error (disk full, permission denied, cannot bind port).
    Io(io::Error),
    /// An HTTP tracker exchange failed at the transport level.
    Http(reqwest::Error),
    /// A tracker answered with a failure reason or a malformed response.
    Tracker(String),
    /// No tracker returned any peer address.
    NoPeers,
    /// The peer's handshake advertised a different info hash than ours.
    InvalidPeerInfoHash,
    /// The peer referred to a piece index outside the torrent.
    InvalidPieceIndex,
    /// The peer sent a block that doesn't map to a valid block boundary.
    InvalidBlock,
    /// The peer's bitfield had bits set past the last piece.
    InvalidBitfield,
    /// The peer sent a bitfield message after the availability exchange.
    BitfieldNotAfterHandshake,
    /// The peer connection could not be established in time.
    ConnectTimeout,
    /// The peer went silent for longer than the inactivity limit.
    InactivityTimeout,
    /// A piece kept failing its hash check and was given up on. This aborts
    /// the download: the swarm evidently cannot produce valid data for it.
    PieceUnrecoverable(PieceIndex),
    /// A channel between engine tasks was unexpectedly closed.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "metainfo bencode error: {}", e),
            Error::InvalidMetainfo(what) => {
                write!(f, "invalid metainfo: {}", what)
            }
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Http(e) => write!(f, "HTTP tracker error: {}", e),
            Error::Tracker(reason) => write!(f, "tracker error: {}", reason),
            Error::NoPeers => write!(f, "no peers discoverable"),
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake contained invalid info hash")
            }
            Error::InvalidPieceIndex => write!(f, "piece index out of range"),
            Error::InvalidBlock => write!(f, "invalid block boundary"),
            Error::InvalidBitfield => {
                write!(f, "bitfield has bits set past the last piece")
            }
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield sent not directly after handshake")
            }
            Error::ConnectTimeout => write!(f, "peer connect timeout"),
            Error::InactivityTimeout => write!(f, "peer inactivity timeout"),
            Error::PieceUnrecoverable(index) => {
                write!(f, "piece {} failed verification too many times", index)
            }
            Error::Channel => write!(f, "engine channel unexpectedly closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bencode(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}
