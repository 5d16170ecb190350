//! Peer-to-peer piece exchange engine for swarmpush.
//!
//! Both node roles embed this crate: the server seeds every task it
//! orchestrates, agents start empty and become seeders piece by piece. All
//! session state is owned by a single planner task per session and mutated
//! only through its event channel, so the engine has no session-wide locks.

mod bitset;
mod error;
mod hasher;
mod mgnt;
mod peer;
mod piece;
mod session;
mod store;
mod task;
mod wire;

pub use bitset::Bitset;
pub use error::{Error, Result};
pub use hasher::{check_pieces, compute_all_sums, compute_one_sum, PIECE_HASH_LEN};
pub use mgnt::SessionMgnt;
pub use piece::ActivePiece;
pub use session::{
    EngineConfig, ReportSink, SessionProgress, SessionState, DEFAULT_BLOCK_SIZE,
    DEFAULT_MAX_ACTIVE_PER_PEER, DEFAULT_PIPELINE_DEPTH,
};
pub use store::{DiskStore, FileStore, MemStore};
pub use task::{
    task_id_bytes, DispatchTask, FileSpec, MetaInfo, Role, StartTask, StatusReport, PROTOCOL_ID,
    TASK_ID_LEN,
};
pub use wire::{Handshake, Message, PeerCodec};

#[macro_export]
macro_rules! ArcMutex {
    ($e : expr) => {
        Arc::new(Mutex::new($e))
    };
}
