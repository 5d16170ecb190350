use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::messages::{Message, MessageTag};
use crate::error::{Error, Result};

/// Frames peer messages over a byte stream.
///
/// The decoder peeks at the 4-byte length prefix without consuming it until
/// the whole frame is buffered, then dispatches on the id byte. Frames larger
/// than the ceiling negotiated from the piece geometry are a protocol
/// violation, not something to buffer up.
#[derive(Debug, Clone)]
pub struct PeerCodec {
    max_payload: usize,
}

impl PeerCodec {
    /// `max_payload` bounds the length prefix; sessions size it to fit one
    /// block message or the task's bitfield, whichever is larger.
    pub fn new(max_payload: usize) -> PeerCodec {
        PeerCodec { max_payload }
    }

    /// Ceiling for a task with `num_pieces` pieces exchanging `block_size`
    /// blocks.
    pub fn max_payload_for(block_size: u32, num_pieces: u32) -> usize {
        let piece_msg = 9 + block_size as usize;
        let bitfield_msg = 1 + (num_pieces as usize + 7) / 8;
        piece_msg.max(bitfield_msg)
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => put_bare(dst, MessageTag::Choke),
            Message::Unchoke => put_bare(dst, MessageTag::Unchoke),
            Message::Interested => put_bare(dst, MessageTag::Interested),
            Message::NotInterested => put_bare(dst, MessageTag::NotInterested),
            Message::Have { piece } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageTag::Have as u8);
                dst.put_u32(piece);
            }
            Message::Bitfield { bits } => {
                dst.put_u32(1 + bits.len() as u32);
                dst.put_u8(MessageTag::Bitfield as u8);
                dst.put_slice(&bits);
            }
            Message::Request {
                piece,
                begin,
                length,
            } => {
                dst.put_u32(1 + 12);
                dst.put_u8(MessageTag::Request as u8);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Piece { piece, begin, data } => {
                dst.put_u32(1 + 8 + data.len() as u32);
                dst.put_u8(MessageTag::Piece as u8);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => {
                dst.put_u32(1 + 12);
                dst.put_u8(MessageTag::Cancel as u8);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.remaining() < 4 {
            return Ok(None);
        }

        // Peek the length prefix; it is only consumed once the whole frame
        // is in the buffer.
        let mut peek = Cursor::new(&src[..]);
        let frame_len = peek.get_u32() as usize;
        if frame_len > self.max_payload {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds the {} byte ceiling",
                frame_len, self.max_payload
            )));
        }
        if src.remaining() < 4 + frame_len {
            return Ok(None);
        }
        src.advance(4);

        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let tag = MessageTag::try_from(src.get_u8())?;
        let msg = match tag {
            MessageTag::Choke => Message::Choke,
            MessageTag::Unchoke => Message::Unchoke,
            MessageTag::Interested => Message::Interested,
            MessageTag::NotInterested => Message::NotInterested,
            MessageTag::Have => {
                expect_len(tag, frame_len, 5)?;
                Message::Have {
                    piece: src.get_u32(),
                }
            }
            MessageTag::Bitfield => Message::Bitfield {
                bits: src.split_to(frame_len - 1).freeze(),
            },
            MessageTag::Request => {
                expect_len(tag, frame_len, 13)?;
                Message::Request {
                    piece: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            MessageTag::Piece => {
                if frame_len < 9 {
                    return Err(Error::protocol("piece frame shorter than its header"));
                }
                Message::Piece {
                    piece: src.get_u32(),
                    begin: src.get_u32(),
                    data: src.split_to(frame_len - 9).freeze(),
                }
            }
            MessageTag::Cancel => {
                expect_len(tag, frame_len, 13)?;
                Message::Cancel {
                    piece: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
        };
        Ok(Some(msg))
    }
}

fn put_bare(dst: &mut BytesMut, tag: MessageTag) {
    dst.put_u32(1);
    dst.put_u8(tag as u8);
}

fn expect_len(tag: MessageTag, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::protocol(format!(
            "{:?} frame is {} bytes, expected {}",
            tag, got, want
        )));
    }
    Ok(())
}
