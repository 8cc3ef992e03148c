//! Framing of the peer wire protocol.
//!
//! Two codecs share the TCP stream over the lifetime of a connection: the
//! fixed size [`HandshakeCodec`] for the first frame in each direction, and
//! the length prefixed [`PeerCodec`] for everything after. Both are pure:
//! they only inspect and produce buffers, so all IO policy (dropping the
//! connection on a decode error, say) stays with the session.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string literal that starts every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the handshake frame: 1 + 19 + 8 + 20 + 20.
const HANDSHAKE_LEN: usize = 68;

/// The first frame exchanged on a new connection, both directions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always [`PROTOCOL_STRING`] after a successful
    /// decode.
    pub prot: [u8; 19],
    /// Extension bits. This client advertises none.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the protocol string length is fixed, so we can reject a bad
        // handshake before the full frame has arrived
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(invalid_data("handshake protocol string length"));
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let mut frame = buf.split_to(HANDSHAKE_LEN);
        frame.advance(1);

        let mut prot = [0; 19];
        frame.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(invalid_data("handshake protocol string"));
        }

        let mut reserved = [0; 8];
        frame.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        frame.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        frame.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The protocol message ids as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

/// A message of the peer wire protocol. Keep-alives are the empty frame and
/// have no id.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's wire id, or `None` for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Codec for the length prefixed message stream that follows the handshake.
pub(crate) struct PeerCodec {
    /// Frames longer than this are treated as a protocol violation. Sized
    /// from the torrent's piece length, as the largest legitimate frame is
    /// a block message.
    max_frame_len: u32,
}

impl PeerCodec {
    /// `max_payload_len` is the largest legal frame payload: the block
    /// message header (9 bytes) plus the torrent's piece length covers every
    /// message type.
    pub fn new(max_payload_len: u32) -> Self {
        Self {
            max_frame_len: max_payload_len,
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(4 + 1);
                buf.put_u32(1);
                // the `id()` of these variants is always present
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(4 + 1 + 4);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.reserve(4 + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bytes);
            }
            Message::Request(block) => {
                buf.reserve(4 + 13);
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(4 + 9 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.reserve(4 + 13);
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = {
            let mut prefix = &buf[..4];
            prefix.get_u32()
        };

        if frame_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if frame_len > self.max_frame_len {
            return Err(invalid_data("frame exceeds the length cap"));
        }
        let frame_len = frame_len as usize;

        if buf.len() < 4 + frame_len {
            // an early reserve here saves repeated growth while the rest of
            // the frame trickles in
            buf.reserve(4 + frame_len - buf.len());
            return Ok(None);
        }
        let mut frame = buf.split_to(4 + frame_len);
        frame.advance(4);

        let id = frame.get_u8();
        let payload_len = frame_len - 1;
        let msg = match id {
            0 | 1 | 2 | 3 => {
                if payload_len != 0 {
                    return Err(invalid_data("flag message with a payload"));
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if payload_len != 4 {
                    return Err(invalid_data("have payload length"));
                }
                Message::Have {
                    piece_index: frame.get_u32() as PieceIndex,
                }
            }
            5 => {
                if payload_len == 0 {
                    return Err(invalid_data("empty bitfield"));
                }
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            6 | 8 => {
                if payload_len != 12 {
                    return Err(invalid_data("request payload length"));
                }
                let block = BlockInfo {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    len: frame.get_u32(),
                };
                if id == 6 {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            7 => {
                if payload_len <= 8 {
                    return Err(invalid_data("block payload length"));
                }
                Message::Block {
                    piece_index: frame.get_u32() as PieceIndex,
                    offset: frame.get_u32(),
                    data: frame.to_vec(),
                }
            }
            id => {
                log::debug!("Unknown message id {}", id);
                return Err(invalid_data("unknown message id"));
            }
        };

        Ok(Some(msg))
    }
}

fn invalid_data(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}
