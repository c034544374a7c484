//! MessagePack-RPC framing and per-client session state.
//!
//! The wire carries a plain concatenation of MessagePack-RPC messages, three
//! kinds framed as arrays: `[0, msgid, method, params]`,
//! `[1, msgid, error, result]`, `[2, method, params]`. There is no length
//! prefix; framing falls out of the streaming decoder consuming exactly one
//! top-level value per message.

pub mod message;
pub mod session;

pub use message::Message;
pub use session::{OutboundKind, RpcSession, SessionEvent};
