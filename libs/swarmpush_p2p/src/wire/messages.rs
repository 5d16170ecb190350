use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::task::{task_id_bytes, PROTOCOL_ID, TASK_ID_LEN};

/// Messages exchanged between peers after a successful handshake.
///
/// Every frame is a 4-byte big-endian length prefix counting the id byte plus
/// payload; a length of zero is a keep-alive.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    /// Sender will not service requests from the receiver.
    Choke,
    /// Sender will service requests again.
    Unchoke,
    /// Sender wants at least one piece the receiver has.
    Interested,
    /// Sender wants nothing the receiver has.
    NotInterested,
    /// Sender newly holds this piece.
    Have { piece: u32 },
    /// Sender's full piece set, sent once right after the handshake.
    Bitfield { bits: Bytes },
    /// Ask for one block of a piece.
    Request { piece: u32, begin: u32, length: u32 },
    /// Deliver one block of a piece.
    Piece { piece: u32, begin: u32, data: Bytes },
    /// Withdraw an earlier request; used while duplicating work in endgame.
    Cancel { piece: u32, begin: u32, length: u32 },
}

/// Wire ids of the non-keep-alive messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageTag {
    type Error = Error;

    fn try_from(tag: u8) -> Result<MessageTag> {
        use MessageTag::*;
        Ok(match tag {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            other => return Err(Error::protocol(format!("unknown message tag {}", other))),
        })
    }
}

/// Connection preamble, sent by the dialing side first and answered by the
/// accepting side before any frame.
///
/// Structure:
///
/// `<id len u8><protocol id><task id, 20 bytes><peer id len u8><peer id>`
///
/// The receiver validates the protocol id, resolves the task id against its
/// live sessions and checks the peer id against the task roster; any mismatch
/// closes the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub task_id: [u8; TASK_ID_LEN],
    pub peer_id: String,
}

impl Handshake {
    pub fn new(task_id: &str, peer_id: &str) -> Handshake {
        Handshake {
            task_id: task_id_bytes(task_id),
            peer_id: peer_id.to_owned(),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + PROTOCOL_ID.len() + TASK_ID_LEN + 1 + self.peer_id.len());
        buf.put_u8(PROTOCOL_ID.len() as u8);
        buf.put_slice(PROTOCOL_ID);
        buf.put_slice(&self.task_id);
        buf.put_u8(self.peer_id.len() as u8);
        buf.put_slice(self.peer_id.as_bytes());
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake> {
        let id_len = reader.read_u8().await? as usize;
        if id_len != PROTOCOL_ID.len() {
            return Err(Error::protocol("unexpected protocol id length"));
        }
        let mut id = vec![0u8; id_len];
        reader.read_exact(&mut id).await?;
        if id != PROTOCOL_ID {
            return Err(Error::protocol("unexpected protocol id"));
        }
        let mut task_id = [0u8; TASK_ID_LEN];
        reader.read_exact(&mut task_id).await?;
        let peer_len = reader.read_u8().await? as usize;
        let mut peer = vec![0u8; peer_len];
        reader.read_exact(&mut peer).await?;
        let peer_id = String::from_utf8(peer)
            .map_err(|_| Error::protocol("peer id is not valid utf-8"))?;
        Ok(Handshake { task_id, peer_id })
    }
}
