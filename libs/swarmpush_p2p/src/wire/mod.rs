mod codec;
mod messages;

pub use codec::PeerCodec;
pub use messages::{Handshake, Message, MessageTag};
