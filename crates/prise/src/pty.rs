//! PTY ownership: handle plumbing, dirty-pipe signalling, the blocking
//! reader worker, and the per-session state bundle.

pub mod handle;
pub mod pipe;
pub mod reader;
pub mod session;

pub use handle::{PtyHandle, SpawnOptions};
pub use pipe::{DirtyReceiver, DirtySender, dirty_pipe};
pub use session::PtySession;
