//! Per-session state bundle.
//!
//! A `PtySession` owns the pty handle, the terminal model, the dirty pipe's
//! read end, the reader worker, and the render-pacing fields the frame
//! scheduler works with. Cross-references to clients are ids only; the
//! session manager owns both tables and resolves them.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use portable_pty::ExitStatus;

use crate::pty::handle::{PtyHandle, SpawnOptions};
use crate::pty::pipe::{self, Drain, DirtyReceiver};
use crate::pty::reader;
use crate::reactor::TaskId;
use crate::term::{Frame, Terminal, VtScreen};

pub struct PtySession {
  pub id: u64,
  pub handle: PtyHandle,
  term: Arc<Mutex<Box<dyn Terminal + Send>>>,
  dirty_rx: DirtyReceiver,
  worker: Option<std::thread::JoinHandle<()>>,
  /// Attached client ids.
  pub clients: HashSet<u64>,
  pub cols: u16,
  pub rows: u16,
  pub last_render_time: Instant,
  pub render_timer: Option<TaskId>,
  /// Task id of the armed dirty-pipe read, if any.
  pub pipe_read_task: Option<TaskId>,
  /// Last published title / bell count, for change detection at render.
  pub last_title: String,
  pub last_bell: usize,
}

impl PtySession {
  /// Opens the pty, spawns the child and the reader worker, and wires the
  /// dirty pipe. `now` is the reactor clock; the first dirty signal must
  /// render immediately, so the pacing clock starts in the past.
  pub fn spawn(id: u64, options: &SpawnOptions, now: Instant) -> anyhow::Result<Self> {
    let mut handle = PtyHandle::open(options)?;
    let term: Arc<Mutex<Box<dyn Terminal + Send>>> = Arc::new(Mutex::new(Box::new(
      VtScreen::new(options.cols, options.rows),
    )));
    let (dirty_tx, dirty_rx) = pipe::dirty_pipe()?;
    let source = handle.clone_reader()?;
    let reply = handle.take_reply_writer()?;
    let worker = reader::spawn(id, source, Arc::clone(&term), reply, dirty_tx)?;

    Ok(Self {
      id,
      handle,
      term,
      dirty_rx,
      worker: Some(worker),
      clients: HashSet::new(),
      cols: options.cols,
      rows: options.rows,
      last_render_time: now
        .checked_sub(std::time::Duration::from_secs(1))
        .unwrap_or(now),
      render_timer: None,
      pipe_read_task: None,
      last_title: String::new(),
      last_bell: 0,
    })
  }

  #[must_use]
  pub fn pipe_fd(&self) -> RawFd {
    self.dirty_rx.fd()
  }

  /// Drains the dirty pipe, folding in bytes the reactor read already.
  pub fn drain_dirty(&mut self, head: &[u8]) -> Drain {
    self.dirty_rx.drain(head)
  }

  /// Snapshot for a redraw. Locks the terminal for the copy; the worker's
  /// writes before the observed pipe byte are visible by then.
  #[must_use]
  pub fn frame(&self) -> Frame {
    self.term.lock().frame()
  }

  #[must_use]
  pub fn title(&self) -> String {
    self.term.lock().title()
  }

  #[must_use]
  pub fn bell_count(&self) -> usize {
    self.term.lock().bell_count()
  }

  pub fn resize(&mut self, cols: u16, rows: u16) -> anyhow::Result<()> {
    self.handle.resize(cols, rows)?;
    self.term.lock().resize(cols, rows);
    self.cols = cols;
    self.rows = rows;
    Ok(())
  }

  pub fn exit_status(&mut self) -> Option<ExitStatus> {
    self.handle.try_wait()
  }

  /// Terminates the child. The worker notices the resulting EOF and exits
  /// through the normal dirty-pipe path.
  pub fn kill(&mut self) {
    self.handle.kill();
  }

  /// Joins the reader worker. Only safe to call after the exit byte was
  /// observed (the worker has already broken out of its read loop) or after
  /// the child was killed.
  pub fn join_worker(&mut self) {
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}
