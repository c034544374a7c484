//! Deterministic in-process backend for tests.
//!
//! No real fds are touched. Reads and accepts complete from queues the test
//! feeds through a [`MockHandle`]; writes are captured; the clock is virtual
//! and advances by exactly the wait timeout, so timer behavior is exact and
//! instant.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::reactor::{Backend, FdOp, OpResult, Submit, TaskId};

struct MockState {
  now: Instant,
  pending: BTreeMap<TaskId, FdOp>,
  reads: HashMap<RawFd, VecDeque<Vec<u8>>>,
  accepts: HashMap<RawFd, VecDeque<RawFd>>,
  written: HashMap<RawFd, Vec<u8>>,
  next_fd: RawFd,
}

impl MockState {
  fn take_ready(&mut self, op: &FdOp) -> Option<OpResult> {
    match op {
      FdOp::Read { fd } => self
        .reads
        .get_mut(fd)
        .and_then(VecDeque::pop_front)
        .map(OpResult::Read),
      FdOp::Accept { fd } => self
        .accepts
        .get_mut(fd)
        .and_then(VecDeque::pop_front)
        .map(OpResult::Accepted),
      _ => None,
    }
  }
}

pub struct MockBackend {
  state: Rc<RefCell<MockState>>,
}

/// Test-side handle for feeding and inspecting the mock.
#[derive(Clone)]
pub struct MockHandle {
  state: Rc<RefCell<MockState>>,
}

impl MockBackend {
  #[must_use]
  pub fn new() -> (Self, MockHandle) {
    let state = Rc::new(RefCell::new(MockState {
      now: Instant::now(),
      pending: BTreeMap::new(),
      reads: HashMap::new(),
      accepts: HashMap::new(),
      written: HashMap::new(),
      next_fd: 1000,
    }));
    (
      Self {
        state: Rc::clone(&state),
      },
      MockHandle { state },
    )
  }
}

impl MockHandle {
  /// Queues one read completion worth of bytes on `fd`.
  pub fn feed(&self, fd: RawFd, bytes: Vec<u8>) {
    self
      .state
      .borrow_mut()
      .reads
      .entry(fd)
      .or_default()
      .push_back(bytes);
  }

  /// Queues an EOF (empty read) on `fd`.
  pub fn feed_eof(&self, fd: RawFd) {
    self.feed(fd, Vec::new());
  }

  /// Queues an inbound connection on listener `fd`.
  pub fn push_accept(&self, fd: RawFd, conn: RawFd) {
    self
      .state
      .borrow_mut()
      .accepts
      .entry(fd)
      .or_default()
      .push_back(conn);
  }

  /// Everything written to `fd` so far.
  #[must_use]
  pub fn written(&self, fd: RawFd) -> Vec<u8> {
    self
      .state
      .borrow()
      .written
      .get(&fd)
      .cloned()
      .unwrap_or_default()
  }

  /// Moves the virtual clock forward without waiting.
  pub fn advance(&self, by: Duration) {
    self.state.borrow_mut().now += by;
  }

  #[must_use]
  pub fn now(&self) -> Instant {
    self.state.borrow().now
  }

  /// Allocates a fake fd number for tests that need distinct fds.
  #[must_use]
  pub fn alloc_fd(&self) -> RawFd {
    let mut state = self.state.borrow_mut();
    let fd = state.next_fd;
    state.next_fd += 1;
    fd
  }
}

impl Backend for MockBackend {
  fn now(&self) -> Instant {
    self.state.borrow().now
  }

  fn submit(&mut self, id: TaskId, op: FdOp) -> Submit {
    let mut state = self.state.borrow_mut();
    match op {
      FdOp::Socket => {
        let fd = state.next_fd;
        state.next_fd += 1;
        Submit::Ready(OpResult::Socket(fd))
      }
      FdOp::Connect { .. } => {
        let fd = state.next_fd;
        state.next_fd += 1;
        Submit::Ready(OpResult::Connected(fd))
      }
      FdOp::Close { .. } => Submit::Ready(OpResult::Closed),
      FdOp::Write { fd, buf } => {
        let len = buf.len();
        state.written.entry(fd).or_default().extend_from_slice(&buf);
        Submit::Ready(OpResult::Wrote(len))
      }
      op @ (FdOp::Read { .. } | FdOp::Accept { .. }) => match state.take_ready(&op) {
        Some(result) => Submit::Ready(result),
        None => {
          state.pending.insert(id, op);
          Submit::Pending
        }
      },
    }
  }

  fn cancel(&mut self, id: TaskId) {
    self.state.borrow_mut().pending.remove(&id);
  }

  fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(TaskId, OpResult)>) {
    let mut state = self.state.borrow_mut();
    // Satisfy pending ops from whatever the test fed since the last pass.
    let ids: Vec<TaskId> = state.pending.keys().copied().collect();
    for id in ids {
      let Some(op) = state.pending.remove(&id) else {
        continue;
      };
      match state.take_ready(&op) {
        Some(result) => out.push((id, result)),
        None => {
          state.pending.insert(id, op);
        }
      }
    }
    if out.is_empty()
      && let Some(d) = timeout
    {
      state.now += d;
    }
  }

  fn pending(&self) -> usize {
    self.state.borrow().pending.len()
  }
}
