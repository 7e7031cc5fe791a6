//! Framed peer wire messages
//!
//! Defines every framed message of the peer wire protocol, including the
//! fast extension (BEP 6) set.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Result, TransferError};

/// Leading id byte of a framed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::SuggestPiece),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::RejectRequest),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(TransferError::protocol_error(format!(
                "Invalid message ID: {}",
                value
            ))),
        }
    }
}

/// A requested byte range within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockKey {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// A decoded peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    SuggestPiece { piece_index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { index: u32, begin: u32, length: u32 },
    AllowedFast { piece_index: u32 },
    Extended { extended_id: u8, payload: Bytes },
}

impl Message {
    /// Id byte on the wire; keep-alives carry none
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::SuggestPiece { .. } => Some(MessageId::SuggestPiece),
            Message::HaveAll => Some(MessageId::HaveAll),
            Message::HaveNone => Some(MessageId::HaveNone),
            Message::RejectRequest { .. } => Some(MessageId::RejectRequest),
            Message::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Value of the 4-byte length prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. } | Message::SuggestPiece { .. } | Message::AllowedFast { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } | Message::RejectRequest { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Block coordinates of a piece message
    pub fn piece_key(&self) -> Option<BlockKey> {
        match self {
            Message::Piece {
                index,
                begin,
                block,
            } => Some(BlockKey::new(*index, *begin, block.len() as u32)),
            _ => None,
        }
    }

    /// Encode as a length-prefixed frame
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { piece_index }
            | Message::SuggestPiece { piece_index }
            | Message::AllowedFast { piece_index } => {
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::RejectRequest {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => {
                buf.put_u16(*listen_port);
            }
            Message::Extended {
                extended_id,
                payload,
            } => {
                buf.put_u8(*extended_id);
                buf.put_slice(payload);
            }
        }

        trace!("Encoded {} into {} bytes", self, buf.len());
        buf.freeze()
    }

    /// Decode a frame payload (the bytes after the length prefix)
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(payload.get_u8())?;
        let body_len = payload.remaining();
        let expect = |len: usize| -> Result<()> {
            if body_len != len {
                return Err(TransferError::protocol_error(format!(
                    "{:?} message has invalid length: expected {} bytes, got {}",
                    id, len, body_len
                )));
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::HaveAll => {
                expect(0)?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                expect(0)?;
                Message::HaveNone
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::SuggestPiece => {
                expect(4)?;
                Message::SuggestPiece {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect(4)?;
                Message::AllowedFast {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request | MessageId::Cancel | MessageId::RejectRequest => {
                expect(12)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                match id {
                    MessageId::Request => Message::Request {
                        index,
                        begin,
                        length,
                    },
                    MessageId::Cancel => Message::Cancel {
                        index,
                        begin,
                        length,
                    },
                    _ => Message::RejectRequest {
                        index,
                        begin,
                        length,
                    },
                }
            }
            MessageId::Piece => {
                if body_len < 8 {
                    return Err(TransferError::protocol_error(format!(
                        "Piece message too short: expected at least 8 bytes, got {}",
                        body_len
                    )));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port {
                    listen_port: payload.get_u16(),
                }
            }
            MessageId::Extended => {
                if body_len < 1 {
                    return Err(TransferError::protocol_error(
                        "Extended message missing extended ID",
                    ));
                }
                let extended_id = payload.get_u8();
                Message::Extended {
                    extended_id,
                    payload,
                }
            }
        };
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { piece_index } => write!(f, "have index={}", piece_index),
            Message::Bitfield { bitfield } => write!(f, "bitfield {}", hex::encode(bitfield)),
            Message::Request {
                index,
                begin,
                length,
            } => write!(f, "request index={}, begin={}, length={}", index, begin, length),
            Message::Piece {
                index,
                begin,
                block,
            } => write!(f, "piece index={}, begin={}, length={}", index, begin, block.len()),
            Message::Cancel {
                index,
                begin,
                length,
            } => write!(f, "cancel index={}, begin={}, length={}", index, begin, length),
            Message::Port { listen_port } => write!(f, "port port={}", listen_port),
            Message::SuggestPiece { piece_index } => write!(f, "suggest piece index={}", piece_index),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::RejectRequest {
                index,
                begin,
                length,
            } => write!(f, "reject index={}, begin={}, length={}", index, begin, length),
            Message::AllowedFast { piece_index } => write!(f, "allowed fast index={}", piece_index),
            Message::Extended {
                extended_id,
                payload,
            } => write!(f, "extended id={}, length={}", extended_id, payload.len()),
        }
    }
}
