//! Script host seam.
//!
//! The server never exposes its object graph to a script. Events go in,
//! actions come out, and everything a script can point at is an opaque
//! handle the host resolves to an internal id on every use. Scripts run to
//! completion per event on the main thread and must not block; side effects
//! (spawns, writes, timers) are deferred through the reactor by the bridge.

pub mod default;

pub use default::PassthroughScript;

use crate::keys::KeyEvent;
use crate::pty::SpawnOptions;

/// Opaque handle to a pty session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PtyRef(pub(crate) u64);

/// Opaque handle to a script timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerRef(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
  /// A pty became available to the script (spawn completed, or a client
  /// attached a session the script had not seen).
  PtyAttach { pty: PtyRef },
  PtyExited { id: u64 },
  KeyPress { key: KeyEvent },
  Winsize { cols: u16, rows: u16 },
  /// An elapsed `set_timeout`, identified by the script-chosen token.
  Timer { token: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
  Info,
  Warn,
  Err,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptAction {
  Spawn { options: SpawnOptions },
  SendKey { pty: PtyRef, key: KeyEvent },
  Write { pty: PtyRef, bytes: Vec<u8> },
  /// Force a render on the session's next scheduler tick.
  RequestFrame { pty: PtyRef },
  SetTimeout { ms: u64, token: u64 },
  CancelTimer { timer: TimerRef },
  Quit,
  Log { level: LogLevel, message: String },
}

/// Synchronous queries a script may make while handling an event. Mutations
/// are not available here; those are actions.
pub trait ScriptHost {
  /// Resolves a handle to its stable id.
  fn pty_id(&self, pty: PtyRef) -> u64;
  /// Current title, or `None` for a stale handle.
  fn pty_title(&self, pty: PtyRef) -> Option<String>;
  /// The pty the triggering event targets, when there is one (key routing).
  fn focused_pty(&self) -> Option<PtyRef>;
}

pub trait Script {
  /// Handles one event and returns the actions to apply. An error here is
  /// contained: the bridge logs it and discards the actions.
  fn dispatch(
    &mut self,
    event: ScriptEvent,
    host: &dyn ScriptHost,
  ) -> anyhow::Result<Vec<ScriptAction>>;
}
