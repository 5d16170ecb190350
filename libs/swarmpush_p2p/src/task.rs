use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hasher::PIECE_HASH_LEN;

/// Identifier string sent first in the peer handshake.
pub const PROTOCOL_ID: &[u8] = b"swarmpush/1";

/// Width of the task-id field in the handshake preamble.
pub const TASK_ID_LEN: usize = 20;

/// One file of a dispatch payload. The path is the server-side path of the
/// source file; agents mirror it under their configured downloads root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub length: u64,
}

/// Immutable description of a dispatch payload: the file list, the piece
/// geometry and the SHA-1 table all piece exchange is verified against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub piece_length: u64,
    pub total_length: u64,
    /// Concatenated 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    pub files: Vec<FileSpec>,
}

impl MetaInfo {
    pub fn num_pieces(&self) -> u32 {
        ((self.total_length + self.piece_length - 1) / self.piece_length) as u32
    }

    /// Byte length of piece `index`; the final piece is short when
    /// `total_length` is not a multiple of `piece_length`.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length) as u32
    }

    /// Expected digest of piece `index`.
    pub fn piece_hash(&self, index: u32) -> &[u8] {
        let base = index as usize * PIECE_HASH_LEN;
        &self.pieces[base..base + PIECE_HASH_LEN]
    }

    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(Error::InvalidMetaInfo("piece_length is zero".into()));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidMetaInfo("empty file list".into()));
        }
        let sum: u64 = self.files.iter().map(|f| f.length).sum();
        if sum != self.total_length {
            return Err(Error::InvalidMetaInfo(format!(
                "file lengths sum to {}, total_length says {}",
                sum, self.total_length
            )));
        }
        let expect = self.num_pieces() as usize * PIECE_HASH_LEN;
        if self.pieces.len() != expect {
            return Err(Error::InvalidMetaInfo(format!(
                "pieces table is {} bytes, expected {}",
                self.pieces.len(),
                expect
            )));
        }
        Ok(())
    }
}

/// Which side of a task a session plays. The server always holds the full
/// content; agents start empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Agent,
}

/// Server → agent: prepare a task. Receiving a duplicate for a task id that
/// is already live is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub task_id: String,
    pub meta_info: MetaInfo,
    pub self_role: Role,
    /// Participant set as known at dispatch time. The authoritative roster is
    /// the address book of the later StartTask; peering only begins then.
    pub peers: Vec<String>,
    /// Management address of the server, where status reports are posted.
    pub server: String,
}

/// Server → agent: begin peering. Maps every participant's peer id to its
/// data-plane address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTask {
    pub task_id: String,
    pub addresses: HashMap<String, String>,
}

/// Per-session progress, posted to the server at most once per second or on
/// any whole-percent change, and always on a terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: String,
    pub peer_id: String,
    pub percent_complete: f32,
    pub finished: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The handshake carries the task id as a fixed 20-byte field: the UTF-8 id,
/// zero-padded, or truncated when longer.
pub fn task_id_bytes(id: &str) -> [u8; TASK_ID_LEN] {
    let mut out = [0u8; TASK_ID_LEN];
    let raw = id.as_bytes();
    let n = raw.len().min(TASK_ID_LEN);
    out[..n].copy_from_slice(&raw[..n]);
    out
}
