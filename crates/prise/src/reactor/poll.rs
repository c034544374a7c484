//! Readiness backend over mio (epoll/kqueue).
//!
//! Every op is tried eagerly at submit time; only a would-block arms an
//! interest on the fd. That keeps edge-triggered wakeups honest: a newly
//! submitted op never waits for an edge that already happened. One fd holds
//! at most one mio registration whose interests are the union of its queued
//! reader-side (read/accept) and writer-side (write/connect) ops.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::reactor::sys::{self, ConnectStart};
use crate::reactor::{Backend, ErrorKind, FdOp, OpResult, Submit, TaskId};

#[derive(Debug)]
enum PollOp {
  Read { fd: RawFd },
  Accept { fd: RawFd },
  Write { fd: RawFd, buf: Vec<u8> },
  Connect { fd: RawFd },
}

impl PollOp {
  fn fd(&self) -> RawFd {
    match self {
      PollOp::Read { fd }
      | PollOp::Accept { fd }
      | PollOp::Write { fd, .. }
      | PollOp::Connect { fd } => *fd,
    }
  }
}

#[derive(Default)]
struct FdQueues {
  readers: VecDeque<TaskId>,
  writers: VecDeque<TaskId>,
  registered: Option<Interest>,
}

pub struct PollBackend {
  poll: Poll,
  events: Events,
  ops: HashMap<TaskId, PollOp>,
  fds: HashMap<RawFd, FdQueues>,
  /// Completions produced outside `wait` (registration failures).
  ready: VecDeque<(TaskId, OpResult)>,
}

impl PollBackend {
  pub fn new() -> anyhow::Result<Self> {
    Ok(Self {
      poll: Poll::new()?,
      events: Events::with_capacity(256),
      ops: HashMap::new(),
      fds: HashMap::new(),
      ready: VecDeque::new(),
    })
  }

  fn enqueue(&mut self, id: TaskId, op: PollOp, writer_side: bool) {
    let fd = op.fd();
    self.ops.insert(id, op);
    let q = self.fds.entry(fd).or_default();
    if writer_side {
      q.writers.push_back(id);
    } else {
      q.readers.push_back(id);
    }
    self.sync_registration(fd);
  }

  /// Brings the fd's mio registration in line with its queues. On a
  /// registration failure all queued ops on the fd fail; there is no other
  /// way they could ever complete.
  fn sync_registration(&mut self, fd: RawFd) {
    let Some(q) = self.fds.get_mut(&fd) else {
      return;
    };
    let desired = match (q.readers.is_empty(), q.writers.is_empty()) {
      (true, true) => None,
      (false, true) => Some(Interest::READABLE),
      (true, false) => Some(Interest::WRITABLE),
      (false, false) => Some(Interest::READABLE | Interest::WRITABLE),
    };
    if q.registered == desired {
      if desired.is_none() {
        self.fds.remove(&fd);
      }
      return;
    }
    let registry = self.poll.registry();
    let mut src = SourceFd(&fd);
    let token = Token(fd as usize);
    let outcome = match (q.registered, desired) {
      (None, Some(interest)) => registry.register(&mut src, token, interest),
      (Some(_), Some(interest)) => registry.reregister(&mut src, token, interest),
      (Some(_), None) => registry.deregister(&mut src),
      (None, None) => Ok(()),
    };
    match outcome {
      Ok(()) => {
        q.registered = desired;
        if desired.is_none() {
          self.fds.remove(&fd);
        }
      }
      Err(err) => {
        warn!("mio registration failed for fd {fd}: {err}");
        let kind = sys::map_err(&err);
        let ids: Vec<TaskId> = q.readers.drain(..).chain(q.writers.drain(..)).collect();
        let _ = registry.deregister(&mut SourceFd(&fd));
        self.fds.remove(&fd);
        for id in ids {
          self.ops.remove(&id);
          self.ready.push_back((id, OpResult::Err(kind)));
        }
      }
    }
  }

  fn service_readers(&mut self, fd: RawFd, out: &mut Vec<(TaskId, OpResult)>) {
    loop {
      let Some(&id) = self.fds.get(&fd).and_then(|q| q.readers.front()) else {
        return;
      };
      let result = match self.ops.get(&id) {
        Some(PollOp::Read { fd }) => match sys::read(*fd) {
          Ok(Some(bytes)) => Some(OpResult::Read(bytes)),
          Ok(None) => None,
          Err(err) => Some(OpResult::Err(sys::map_err(&err))),
        },
        Some(PollOp::Accept { fd }) => match sys::accept(*fd) {
          Ok(Some(conn)) => Some(OpResult::Accepted(conn)),
          Ok(None) => None,
          Err(err) => Some(OpResult::Err(sys::map_err(&err))),
        },
        _ => Some(OpResult::Err(ErrorKind::Os(libc::EINVAL))),
      };
      match result {
        None => return, // still would-block; stay armed
        Some(result) => {
          self.ops.remove(&id);
          if let Some(q) = self.fds.get_mut(&fd) {
            q.readers.pop_front();
          }
          out.push((id, result));
        }
      }
    }
  }

  fn service_writers(&mut self, fd: RawFd, out: &mut Vec<(TaskId, OpResult)>) {
    loop {
      let Some(&id) = self.fds.get(&fd).and_then(|q| q.writers.front()) else {
        return;
      };
      let result = match self.ops.get(&id) {
        Some(PollOp::Write { fd, buf }) => match sys::write(*fd, buf) {
          Ok(Some(n)) => Some(OpResult::Wrote(n)),
          Ok(None) => None,
          Err(err) => Some(OpResult::Err(sys::map_err(&err))),
        },
        Some(PollOp::Connect { fd }) => {
          let err = sys::so_error(*fd);
          if err == 0 {
            Some(OpResult::Connected(*fd))
          } else {
            sys::close(*fd);
            Some(OpResult::Err(ErrorKind::Os(err)))
          }
        }
        _ => Some(OpResult::Err(ErrorKind::Os(libc::EINVAL))),
      };
      match result {
        None => return,
        Some(result) => {
          self.ops.remove(&id);
          if let Some(q) = self.fds.get_mut(&fd) {
            q.writers.pop_front();
          }
          out.push((id, result));
        }
      }
    }
  }
}

impl Backend for PollBackend {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn submit(&mut self, id: TaskId, op: FdOp) -> Submit {
    match op {
      FdOp::Socket => Submit::Ready(match sys::socket() {
        Ok(fd) => OpResult::Socket(fd),
        Err(err) => OpResult::Err(sys::map_err(&err)),
      }),
      FdOp::Close { fd } => {
        sys::close(fd);
        Submit::Ready(OpResult::Closed)
      }
      FdOp::Connect { path } => match sys::connect_start(&path) {
        Ok(ConnectStart::Done(fd)) => Submit::Ready(OpResult::Connected(fd)),
        Ok(ConnectStart::InProgress(fd)) => {
          self.enqueue(id, PollOp::Connect { fd }, true);
          Submit::Pending
        }
        Err(err) => Submit::Ready(OpResult::Err(sys::map_err(&err))),
      },
      FdOp::Read { fd } => match sys::read(fd) {
        Ok(Some(bytes)) => Submit::Ready(OpResult::Read(bytes)),
        Ok(None) => {
          self.enqueue(id, PollOp::Read { fd }, false);
          Submit::Pending
        }
        Err(err) => Submit::Ready(OpResult::Err(sys::map_err(&err))),
      },
      FdOp::Accept { fd } => match sys::accept(fd) {
        Ok(Some(conn)) => Submit::Ready(OpResult::Accepted(conn)),
        Ok(None) => {
          self.enqueue(id, PollOp::Accept { fd }, false);
          Submit::Pending
        }
        Err(err) => Submit::Ready(OpResult::Err(sys::map_err(&err))),
      },
      FdOp::Write { fd, buf } => match sys::write(fd, &buf) {
        Ok(Some(n)) => Submit::Ready(OpResult::Wrote(n)),
        Ok(None) => {
          self.enqueue(id, PollOp::Write { fd, buf }, true);
          Submit::Pending
        }
        Err(err) => Submit::Ready(OpResult::Err(sys::map_err(&err))),
      },
    }
  }

  fn cancel(&mut self, id: TaskId) {
    let Some(op) = self.ops.remove(&id) else {
      return;
    };
    let fd = op.fd();
    if let Some(q) = self.fds.get_mut(&fd) {
      q.readers.retain(|queued| *queued != id);
      q.writers.retain(|queued| *queued != id);
    }
    // A half-open connect owns its socket; reclaim it.
    if let PollOp::Connect { fd: sock } = op {
      sys::close(sock);
    }
    self.sync_registration(fd);
  }

  fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(TaskId, OpResult)>) {
    if !self.ready.is_empty() {
      out.extend(self.ready.drain(..));
      return;
    }
    match self.poll.poll(&mut self.events, timeout) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
      Err(err) => {
        warn!("poll failed: {err}");
        return;
      }
    }
    let woken: Vec<(RawFd, bool, bool)> = self
      .events
      .iter()
      .map(|ev| {
        (
          ev.token().0 as RawFd,
          ev.is_readable() || ev.is_read_closed() || ev.is_error(),
          ev.is_writable() || ev.is_write_closed() || ev.is_error(),
        )
      })
      .collect();
    for (fd, readable, writable) in woken {
      if readable {
        self.service_readers(fd, out);
      }
      if writable {
        self.service_writers(fd, out);
      }
      self.sync_registration(fd);
    }
    out.extend(self.ready.drain(..));
  }

  fn pending(&self) -> usize {
    self.ops.len()
  }
}
