//! Framing for the BitTorrent peer wire protocol.
//!
//! Two codecs share the socket over the lifetime of a connection: the
//! [`HandshakeCodec`] frames the fixed 68 byte handshake, after which the
//! connection is re-framed with the [`PeerCodec`] for the length-prefixed
//! message protocol (reusing the read buffer, as the peer may pipeline
//! messages directly after its handshake).
//!
//! Callers never see partial messages: a decoder yields a complete, typed
//! [`Message`] or an error that terminates the connection. Unknown message
//! ids are skipped without killing the connection, which is how protocol
//! extensions we don't speak remain harmless.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{PeerError, ProtocolError},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The largest frame we accept: a piece message carrying a block at the
/// protocol's upper request size (2^17 bytes) plus the message overhead.
const MAX_FRAME_LEN: u32 = (1 << 17) + 9;

/// The reserved byte and mask advertising DHT support (BEP 5).
const DHT_BYTE: usize = 7;
const DHT_MASK: u8 = 0x01;

/// The reserved byte and mask advertising the extension protocol (BEP 10).
const EXTENSION_BYTE: usize = 5;
const EXTENSION_MASK: u8 = 0x10;

/// The BitTorrent handshake, exchanged once per connection before any
/// messages.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Extension flag bits. We echo peers' advertised bits back to the
    /// session but advertise none ourselves; the surrounding daemon owns
    /// DHT and the extension protocol.
    pub reserved: [u8; 8],
    /// The torrent's identity. A mismatch with the torrent the connection
    /// was opened for aborts the connection.
    pub info_hash: Sha1Hash,
    /// The remote's self-reported id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a new protocol compliant handshake.
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

    /// Whether the remote advertises DHT support.
    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_MASK != 0
    }

    /// Whether the remote advertises the extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_MASK != 0
    }

    /// The length of the handshake on the wire.
    pub const fn len() -> usize {
        1 + 19 + 8 + 20 + 20
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(Handshake::len());
        buf.put_u8(handshake.prot.len() as u8);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length is checkable before the rest arrives,
        // so a non-BitTorrent remote is rejected on its first byte
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(ProtocolError::InvalidProtocolString.into());
        }
        if buf.len() < Handshake::len() {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(ProtocolError::InvalidProtocolString.into());
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids of the peer wire protocol. Keep-alives carry no id.
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
    Port = 9,
}

impl MessageId {
    fn try_from(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Block),
            8 => Some(Self::Cancel),
            9 => Some(Self::Port),
            _ => None,
        }
    }
}

/// A complete message of the peer wire protocol.
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
    /// The remote's DHT node port (BEP 5). Forwarded, not interpreted.
    Port(u16),
}

impl Message {
    /// The message's id, if it has one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(raw);
            }
            Message::Request(block) => {
                buf.put_u32(1 + 12);
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
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Self::Error> {
        // frames with ids we don't recognize are skipped, so decoding loops
        // until it produces a message or runs out of buffered frames
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            let frame_len =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if frame_len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge(frame_len).into());
            }
            if buf.len() < 4 + frame_len as usize {
                // reserve enough for the rest of the frame to avoid
                // incremental buffer growth on large piece messages
                buf.reserve(4 + frame_len as usize - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            if frame_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = buf.get_u8();
            let payload_len = frame_len - 1;
            let truncated = ProtocolError::TruncatedPayload {
                id,
                len: payload_len,
            };
            let msg_id = match MessageId::try_from(id) {
                Some(msg_id) => msg_id,
                None => {
                    log::debug!("skipping unknown message id {}", id);
                    buf.advance(payload_len as usize);
                    continue;
                }
            };

            let msg = match msg_id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload_len != 4 {
                        return Err(truncated.into());
                    }
                    Message::Have {
                        piece_index: buf.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    let raw = buf.split_to(payload_len as usize);
                    Message::Bitfield(Bitfield::from_vec(raw.to_vec()))
                }
                MessageId::Request => {
                    if payload_len != 12 {
                        return Err(truncated.into());
                    }
                    Message::Request(decode_block_info(buf)?)
                }
                MessageId::Block => {
                    if payload_len < 8 {
                        return Err(truncated.into());
                    }
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let data = buf.split_to((payload_len - 8) as usize).to_vec();
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                MessageId::Cancel => {
                    if payload_len != 12 {
                        return Err(truncated.into());
                    }
                    Message::Cancel(decode_block_info(buf)?)
                }
                MessageId::Port => {
                    if payload_len != 2 {
                        return Err(truncated.into());
                    }
                    Message::Port(buf.get_u16())
                }
            };

            return Ok(Some(msg));
        }
    }
}

fn decode_block_info(buf: &mut BytesMut) -> Result<BlockInfo, PeerError> {
    let piece_index = buf.get_u32() as PieceIndex;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    // peers may legally request blocks larger than ours, up to the frame cap
    if len == 0 || len > 2 * BLOCK_LEN {
        return Err(ProtocolError::InvalidRequestLength(len).into());
    }
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}
