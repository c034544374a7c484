//! Single-threaded submit-and-callback reactor.
//!
//! Every I/O the server performs goes through one of these ops: `socket`,
//! `connect`, `accept`, `read`, `write`, `close`, `timeout`. Submission
//! returns a task id synchronously; the completion is delivered exactly once
//! by invoking the caller's callback with a [`Completion`]. Cancellation is
//! best-effort: a pending op completes with `Err(Canceled)`, a reaped op is
//! left alone.
//!
//! The reactor core owns the timer heap and the callback table; the actual
//! fd work lives in a backend. Three exist: an io_uring completion backend
//! (Linux), a mio readiness backend (epoll/kqueue), and a deterministic mock
//! with a virtual clock for tests. Backends never see timers, which is what
//! makes `cancel_by_fd` trivially exempt them.

pub mod mock;
pub mod poll;
pub(crate) mod sys;
#[cfg(target_os = "linux")]
pub mod uring;

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Reverse;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// Dispatch one batch and return, even if the batch is empty.
  Once,
  /// Loop until no submitted op remains.
  UntilDone,
  /// Loop until [`Reactor::stop`] is called.
  Forever,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
  #[error("operation canceled")]
  Canceled,
  #[error("connection reset by peer")]
  ConnectionReset,
  #[error("broken pipe")]
  BrokenPipe,
  #[error("os error {0}")]
  Os(i32),
}

/// One completed operation, tagged by kind.
#[derive(Debug)]
pub enum OpResult {
  Socket(RawFd),
  Connected(RawFd),
  Accepted(RawFd),
  /// Bytes read; empty means EOF.
  Read(Vec<u8>),
  Wrote(usize),
  Closed,
  TimedOut,
  Err(ErrorKind),
}

#[derive(Debug)]
pub struct Completion {
  pub task: TaskId,
  pub result: OpResult,
}

/// Fd-targeting operations handed to a backend. Timers never reach one.
#[derive(Debug)]
pub enum FdOp {
  Socket,
  Connect { path: PathBuf },
  Accept { fd: RawFd },
  Read { fd: RawFd },
  Write { fd: RawFd, buf: Vec<u8> },
  Close { fd: RawFd },
}

impl FdOp {
  /// Target used by `cancel_by_fd`. `Socket` and `Connect` create their fd
  /// internally and are not addressable that way.
  #[must_use]
  pub fn target_fd(&self) -> Option<RawFd> {
    match self {
      FdOp::Socket | FdOp::Connect { .. } => None,
      FdOp::Accept { fd } | FdOp::Read { fd } | FdOp::Write { fd, .. } | FdOp::Close { fd } => {
        Some(*fd)
      }
    }
  }
}

/// Outcome of handing an op to a backend.
pub enum Submit {
  Pending,
  /// Completed synchronously; the reactor queues the completion for the
  /// next dispatch batch.
  Ready(OpResult),
}

pub trait Backend {
  fn now(&self) -> Instant;
  fn submit(&mut self, id: TaskId, op: FdOp) -> Submit;
  /// Best-effort: unknown ids are a no-op.
  fn cancel(&mut self, id: TaskId);
  /// Blocks up to `timeout` (`None` = until something completes) and pushes
  /// completed ops. The mock backend advances its virtual clock by the
  /// timeout instead of sleeping.
  fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(TaskId, OpResult)>);
  fn pending(&self) -> usize;
}

type Callback<C> = Box<dyn FnOnce(&mut C, &Reactor<C>, Completion)>;

struct Inner<C> {
  backend: Box<dyn Backend>,
  callbacks: HashMap<TaskId, Callback<C>>,
  /// Pending fd-targeted ops, for `cancel_by_fd`.
  fd_of: HashMap<TaskId, RawFd>,
  timers: BinaryHeap<Reverse<(Instant, TaskId)>>,
  /// Completions produced outside `Backend::wait`: synchronous submits and
  /// cancellations.
  ready: VecDeque<Completion>,
  next_id: TaskId,
  stopped: bool,
}

impl<C> Inner<C> {
  fn alloc_id(&mut self) -> TaskId {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  fn collect_due_timers(&mut self, now: Instant, batch: &mut Vec<Completion>) {
    while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
      if deadline > now {
        break;
      }
      self.timers.pop();
      // A canceled timer already had its completion queued; its callback is
      // consumed by that delivery and this pop is a stale heap entry.
      if self.callbacks.contains_key(&id) {
        batch.push(Completion {
          task: id,
          result: OpResult::TimedOut,
        });
      }
    }
  }

  fn next_timer_deadline(&mut self) -> Option<Instant> {
    while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
      if self.callbacks.contains_key(&id) {
        return Some(deadline);
      }
      self.timers.pop();
    }
    None
  }
}

/// Cheap-to-clone handle to the reactor. `C` is the caller context passed
/// back to every callback, so completion handlers can reach server state and
/// submit follow-up ops without shared-ownership cycles.
pub struct Reactor<C> {
  inner: Rc<RefCell<Inner<C>>>,
}

impl<C> Clone for Reactor<C> {
  fn clone(&self) -> Self {
    Self {
      inner: Rc::clone(&self.inner),
    }
  }
}

impl<C> Reactor<C> {
  /// Picks the best backend for the host: io_uring where available, the
  /// readiness backend otherwise. Only the failure of both is fatal.
  pub fn new() -> anyhow::Result<Self> {
    #[cfg(target_os = "linux")]
    {
      match uring::UringBackend::new() {
        Ok(backend) => return Ok(Self::with_backend(Box::new(backend))),
        Err(err) => {
          log::debug!("io_uring unavailable ({err}); using readiness backend");
        }
      }
    }
    let backend = poll::PollBackend::new()?;
    Ok(Self::with_backend(Box::new(backend)))
  }

  #[must_use]
  pub fn with_backend(backend: Box<dyn Backend>) -> Self {
    Self {
      inner: Rc::new(RefCell::new(Inner {
        backend,
        callbacks: HashMap::new(),
        fd_of: HashMap::new(),
        timers: BinaryHeap::new(),
        ready: VecDeque::new(),
        next_id: 1,
        stopped: false,
      })),
    }
  }

  fn submit_op(
    &self,
    op: FdOp,
    cb: impl FnOnCompletion<C>,
  ) -> TaskId {
    let mut inner = self.inner.borrow_mut();
    let id = inner.alloc_id();
    let target = op.target_fd();
    match inner.backend.submit(id, op) {
      Submit::Pending => {
        if let Some(fd) = target {
          inner.fd_of.insert(id, fd);
        }
      }
      Submit::Ready(result) => {
        inner.ready.push_back(Completion { task: id, result });
      }
    }
    inner.callbacks.insert(id, Box::new(cb));
    id
  }

  pub fn socket(&self, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(FdOp::Socket, cb)
  }

  pub fn connect(&self, path: &Path, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(
      FdOp::Connect {
        path: path.to_path_buf(),
      },
      cb,
    )
  }

  pub fn accept(&self, fd: RawFd, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(FdOp::Accept { fd }, cb)
  }

  pub fn read(&self, fd: RawFd, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(FdOp::Read { fd }, cb)
  }

  pub fn write(&self, fd: RawFd, buf: Vec<u8>, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(FdOp::Write { fd, buf }, cb)
  }

  pub fn close(&self, fd: RawFd, cb: impl FnOnCompletion<C>) -> TaskId {
    self.submit_op(FdOp::Close { fd }, cb)
  }

  pub fn timeout(&self, after: Duration, cb: impl FnOnCompletion<C>) -> TaskId {
    let mut inner = self.inner.borrow_mut();
    let id = inner.alloc_id();
    let deadline = inner.backend.now() + after;
    inner.timers.push(Reverse((deadline, id)));
    inner.callbacks.insert(id, Box::new(cb));
    id
  }

  /// Best-effort cancel. If the op is still pending it completes with
  /// `Err(Canceled)`; if it already completed or was reaped this is a no-op.
  pub fn cancel(&self, id: TaskId) {
    let mut inner = self.inner.borrow_mut();
    if !inner.callbacks.contains_key(&id) {
      return;
    }
    // Double-cancel guard: a queued Canceled completion means the first
    // cancel already happened.
    if inner.ready.iter().any(|c| c.task == id) {
      return;
    }
    inner.fd_of.remove(&id);
    inner.backend.cancel(id);
    inner.ready.push_back(Completion {
      task: id,
      result: OpResult::Err(ErrorKind::Canceled),
    });
  }

  /// Cancels every pending op targeting `fd`, regardless of kind. Timers
  /// are exempt (they have no fd).
  pub fn cancel_by_fd(&self, fd: RawFd) {
    let ids: Vec<TaskId> = {
      let inner = self.inner.borrow();
      inner
        .fd_of
        .iter()
        .filter(|&(_, f)| *f == fd)
        .map(|(id, _)| *id)
        .collect()
    };
    for id in ids {
      self.cancel(id);
    }
  }

  /// Backend clock. Virtual under the mock backend, `Instant::now`
  /// otherwise; all render-pacing arithmetic uses this.
  #[must_use]
  pub fn now(&self) -> Instant {
    self.inner.borrow().backend.now()
  }

  pub fn stop(&self) {
    self.inner.borrow_mut().stopped = true;
  }

  #[must_use]
  pub fn is_stopped(&self) -> bool {
    self.inner.borrow().stopped
  }

  /// Number of ops that have not yet delivered their completion.
  #[must_use]
  pub fn pending(&self) -> usize {
    self.inner.borrow().callbacks.len()
  }

  /// Drives the loop. Callbacks run with no internal borrow held, so they
  /// are free to submit and cancel.
  pub fn run(&self, mode: RunMode, ctx: &mut C) {
    loop {
      let mut batch: Vec<Completion> = Vec::new();
      {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
          return;
        }
        batch.extend(inner.ready.drain(..));
        let now = inner.backend.now();
        inner.collect_due_timers(now, &mut batch);

        if batch.is_empty() {
          let timer_wait = inner
            .next_timer_deadline()
            .map(|d| d.saturating_duration_since(now));
          let timeout = match (timer_wait, inner.backend.pending()) {
            (Some(d), _) => Some(d),
            (None, n) if n > 0 => match mode {
              RunMode::Once => Some(Duration::ZERO),
              _ => None,
            },
            // Nothing pending anywhere: never block forever.
            (None, 0) => Some(match mode {
              RunMode::Forever => Duration::from_millis(50),
              _ => Duration::ZERO,
            }),
            (None, _) => unreachable!(),
          };
          let mut fd_batch = Vec::new();
          inner.backend.wait(timeout, &mut fd_batch);
          for (id, result) in fd_batch {
            batch.push(Completion { task: id, result });
          }
          let now = inner.backend.now();
          inner.collect_due_timers(now, &mut batch);
          batch.extend(inner.ready.drain(..));
        }
      }

      for completion in batch {
        let cb = {
          let mut inner = self.inner.borrow_mut();
          inner.fd_of.remove(&completion.task);
          inner.callbacks.remove(&completion.task)
        };
        // Absent callback: the op was canceled and its Canceled delivery
        // already consumed it.
        if let Some(cb) = cb {
          cb(ctx, self, completion);
        }
      }

      match mode {
        RunMode::Once => return,
        RunMode::UntilDone => {
          if self.inner.borrow().callbacks.is_empty() {
            return;
          }
        }
        RunMode::Forever => {
          if self.inner.borrow().stopped {
            return;
          }
        }
      }
    }
  }
}

/// Callback bound shared by every submission method.
pub trait FnOnCompletion<C>: FnOnce(&mut C, &Reactor<C>, Completion) + 'static {}
impl<C, F: FnOnce(&mut C, &Reactor<C>, Completion) + 'static> FnOnCompletion<C> for F {}
