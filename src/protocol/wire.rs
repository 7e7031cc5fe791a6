//! Wire protocol utilities
//!
//! [`FrameReader`] accumulates bytes from a non-blocking socket and splits
//! them into length-prefixed frames. [`OutboundQueue`] holds serialized
//! frames in insertion order and remembers how much of the front frame has
//! already been written, so a partial send resumes where it stopped.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::{BlockKey, Message, MessageId};
use crate::error::{Result, TransferError};

/// Largest frame payload accepted from a peer
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024 + 13;

/// Incremental frame decoder over a partial receive buffer
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Buffered bytes not yet consumed
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Whether a complete frame is buffered
    pub fn has_frame(&self) -> bool {
        if self.buf.len() < 4 {
            return false;
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.buf.len() >= 4 + length as usize
    }

    /// Split off the next complete frame payload, if any.
    ///
    /// An empty payload is a keep-alive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(TransferError::protocol_error(format!(
                "Frame length {} exceeds the maximum of {}",
                length, MAX_FRAME_LENGTH
            )));
        }

        if self.buf.len() < 4 + length {
            return Ok(None);
        }

        self.buf.advance(4);
        Ok(Some(self.buf.split_to(length).freeze()))
    }

    /// Split off a complete 68-byte handshake, if buffered
    pub fn take_handshake(&mut self) -> Option<Bytes> {
        if self.buf.len() < HANDSHAKE_LENGTH {
            return None;
        }
        Some(self.buf.split_to(HANDSHAKE_LENGTH).freeze())
    }
}

/// What an outbound frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake,
    KeepAlive,
    Message(MessageId),
}

/// A serialized frame waiting in the outbound queue
#[derive(Debug)]
pub struct OutboundFrame {
    kind: FrameKind,
    bytes: Bytes,
    written: usize,
    block: Option<BlockKey>,
}

impl OutboundFrame {
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Bytes still to be written
    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.written..]
    }

    /// Record `n` more bytes as written
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.bytes.len());
    }

    /// Whether any byte of this frame reached the socket
    pub fn is_started(&self) -> bool {
        self.written > 0
    }

    pub fn is_done(&self) -> bool {
        self.written == self.bytes.len()
    }

    /// Block coordinates for piece frames
    pub fn block(&self) -> Option<BlockKey> {
        self.block
    }

    /// Payload bytes carried by a piece frame
    pub fn block_payload_len(&self) -> u64 {
        self.block.map(|b| b.length as u64).unwrap_or(0)
    }
}

/// FIFO of outbound frames with resumable partial sends
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<OutboundFrame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message frame
    pub fn push_message(&mut self, message: &Message) {
        let kind = match message.message_id() {
            Some(id) => FrameKind::Message(id),
            None => FrameKind::KeepAlive,
        };
        trace!("Queueing {}", message);
        self.frames.push_back(OutboundFrame {
            kind,
            bytes: message.serialize(),
            written: 0,
            block: message.piece_key(),
        });
    }

    /// Append a handshake frame
    pub fn push_handshake(&mut self, handshake: &Handshake) {
        self.frames.push_back(OutboundFrame {
            kind: FrameKind::Handshake,
            bytes: Bytes::from(handshake.serialize()),
            written: 0,
            block: None,
        });
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether the front frame is partially written
    pub fn is_sending_in_progress(&self) -> bool {
        self.frames.front().map(|f| f.is_started()).unwrap_or(false)
    }

    pub fn front_mut(&mut self) -> Option<&mut OutboundFrame> {
        self.frames.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<OutboundFrame> {
        self.frames.pop_front()
    }

    /// Kinds of the queued frames, front to back
    pub fn kinds(&self) -> Vec<FrameKind> {
        self.frames.iter().map(|f| f.kind).collect()
    }

    /// Whether a frame of this message kind is queued
    pub fn contains(&self, id: MessageId) -> bool {
        self.frames.iter().any(|f| f.kind == FrameKind::Message(id))
    }

    /// Drop the unstarted piece frame for `key`; returns whether one was found
    pub fn remove_unstarted_piece(&mut self, key: &BlockKey) -> bool {
        let before = self.frames.len();
        self.frames
            .retain(|f| f.is_started() || f.block.as_ref() != Some(key));
        self.frames.len() != before
    }

    /// Drop every unstarted piece frame, returning their block keys in order
    pub fn remove_unstarted_pieces(&mut self) -> Vec<BlockKey> {
        let mut removed = Vec::new();
        self.frames.retain(|f| match f.block {
            Some(key) if !f.is_started() => {
                removed.push(key);
                false
            }
            _ => true,
        });
        removed
    }
}
