//! Completion backend over io_uring.
//!
//! Each fd op becomes one SQE with `user_data = task_id`; completions are
//! drained in batches from the CQ. Cancellation pushes an `AsyncCancel` and
//! parks the op's buffers in a zombie table until the kernel's terminal CQE
//! arrives; freeing a buffer the kernel may still write into is not an
//! option.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use io_uring::{IoUring, opcode, squeue, types};
use log::warn;

use crate::reactor::sys::{self, READ_CHUNK};
use crate::reactor::{Backend, ErrorKind, FdOp, OpResult, Submit, TaskId};

/// user_data for AsyncCancel SQEs; never collides with task ids.
const CANCEL_UD: u64 = u64::MAX;

enum UOp {
  Read { buf: Vec<u8> },
  Write { _buf: Vec<u8> },
  Accept,
  Connect { fd: RawFd, _addr: Box<libc::sockaddr_un> },
  Close,
}

pub struct UringBackend {
  ring: IoUring,
  ops: HashMap<TaskId, UOp>,
  /// Canceled ops whose CQE has not been reaped yet; holds buffers alive.
  zombies: HashMap<TaskId, UOp>,
}

impl UringBackend {
  pub fn new() -> io::Result<Self> {
    let ring = IoUring::new(256)?;
    Ok(Self {
      ring,
      ops: HashMap::new(),
      zombies: HashMap::new(),
    })
  }

  fn push(&mut self, entry: squeue::Entry) -> bool {
    unsafe {
      if self.ring.submission().push(&entry).is_ok() {
        return true;
      }
    }
    let _ = self.ring.submit();
    unsafe { self.ring.submission().push(&entry).is_ok() }
  }

  fn complete(op: UOp, res: i32) -> OpResult {
    if res < 0 {
      let errno = -res;
      if let UOp::Connect { fd, .. } = op {
        sys::close(fd);
      }
      return OpResult::Err(match errno {
        libc::ECANCELED => ErrorKind::Canceled,
        libc::ECONNRESET => ErrorKind::ConnectionReset,
        libc::EPIPE => ErrorKind::BrokenPipe,
        code => ErrorKind::Os(code),
      });
    }
    match op {
      UOp::Read { mut buf } => {
        buf.truncate(res as usize);
        OpResult::Read(buf)
      }
      UOp::Write { .. } => OpResult::Wrote(res as usize),
      UOp::Accept => OpResult::Accepted(res),
      UOp::Connect { fd, .. } => OpResult::Connected(fd),
      UOp::Close => OpResult::Closed,
    }
  }

  fn drain(&mut self, out: &mut Vec<(TaskId, OpResult)>) {
    let entries: Vec<(u64, i32)> = self
      .ring
      .completion()
      .map(|cqe| (cqe.user_data(), cqe.result()))
      .collect();
    for (id, res) in entries {
      if id == CANCEL_UD {
        continue;
      }
      if let Some(op) = self.ops.remove(&id) {
        out.push((id, Self::complete(op, res)));
      } else {
        // Reaping the terminal CQE of a canceled op releases its buffers.
        self.zombies.remove(&id);
      }
    }
  }
}

impl Backend for UringBackend {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn submit(&mut self, id: TaskId, op: FdOp) -> Submit {
    match op {
      FdOp::Socket => Submit::Ready(match sys::socket() {
        Ok(fd) => OpResult::Socket(fd),
        Err(err) => OpResult::Err(sys::map_err(&err)),
      }),
      FdOp::Connect { path } => {
        let fd = match sys::socket() {
          Ok(fd) => fd,
          Err(err) => return Submit::Ready(OpResult::Err(sys::map_err(&err))),
        };
        let (addr, len) = match sys::sockaddr_un(&path) {
          Ok(pair) => pair,
          Err(err) => {
            sys::close(fd);
            return Submit::Ready(OpResult::Err(sys::map_err(&err)));
          }
        };
        let addr = Box::new(addr);
        let entry = opcode::Connect::new(types::Fd(fd), std::ptr::from_ref(&*addr).cast(), len)
          .build()
          .user_data(id);
        if !self.push(entry) {
          sys::close(fd);
          return Submit::Ready(OpResult::Err(ErrorKind::Os(libc::EBUSY)));
        }
        self.ops.insert(id, UOp::Connect { fd, _addr: addr });
        Submit::Pending
      }
      FdOp::Accept { fd } => {
        let entry = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
          .flags(libc::SOCK_CLOEXEC)
          .build()
          .user_data(id);
        if !self.push(entry) {
          return Submit::Ready(OpResult::Err(ErrorKind::Os(libc::EBUSY)));
        }
        self.ops.insert(id, UOp::Accept);
        Submit::Pending
      }
      FdOp::Read { fd } => {
        let mut buf = vec![0u8; READ_CHUNK];
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), READ_CHUNK as u32)
          .build()
          .user_data(id);
        if !self.push(entry) {
          return Submit::Ready(OpResult::Err(ErrorKind::Os(libc::EBUSY)));
        }
        self.ops.insert(id, UOp::Read { buf });
        Submit::Pending
      }
      FdOp::Write { fd, buf } => {
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
          .build()
          .user_data(id);
        if !self.push(entry) {
          return Submit::Ready(OpResult::Err(ErrorKind::Os(libc::EBUSY)));
        }
        self.ops.insert(id, UOp::Write { _buf: buf });
        Submit::Pending
      }
      FdOp::Close { fd } => {
        let entry = opcode::Close::new(types::Fd(fd)).build().user_data(id);
        if !self.push(entry) {
          sys::close(fd);
          return Submit::Ready(OpResult::Closed);
        }
        self.ops.insert(id, UOp::Close);
        Submit::Pending
      }
    }
  }

  fn cancel(&mut self, id: TaskId) {
    let Some(op) = self.ops.remove(&id) else {
      return;
    };
    self.zombies.insert(id, op);
    let entry = opcode::AsyncCancel::new(id).build().user_data(CANCEL_UD);
    if self.push(entry) {
      let _ = self.ring.submit();
    }
  }

  fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(TaskId, OpResult)>) {
    if let Err(err) = self.ring.submit() {
      warn!("io_uring submit failed: {err}");
    }
    self.drain(out);
    if !out.is_empty() {
      return;
    }
    let res = match timeout {
      Some(d) if d.is_zero() => Ok(0),
      Some(d) => {
        let ts = types::Timespec::new()
          .sec(d.as_secs())
          .nsec(d.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        self.ring.submitter().submit_with_args(1, &args)
      }
      None => self.ring.submit_and_wait(1),
    };
    if let Err(err) = res {
      match err.raw_os_error() {
        Some(libc::ETIME | libc::EINTR | libc::EBUSY | libc::EAGAIN) => {}
        _ => warn!("io_uring wait failed: {err}"),
      }
    }
    self.drain(out);
  }

  fn pending(&self) -> usize {
    self.ops.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::reactor::{Completion, Reactor, RunMode};

  #[derive(Default)]
  struct Ctx {
    reads: Vec<Vec<u8>>,
    canceled: usize,
  }

  fn reactor() -> Option<Reactor<Ctx>> {
    match UringBackend::new() {
      Ok(backend) => Some(Reactor::with_backend(Box::new(backend))),
      // Rings are often unavailable in sandboxes; the poll backend covers
      // the same contract there.
      Err(_) => None,
    }
  }

  fn unix_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
  }

  #[test]
  fn read_completes_through_the_ring() {
    let Some(rx) = reactor() else { return };
    let mut ctx = Ctx::default();
    let (read_fd, write_fd) = unix_pipe();

    rx.read(read_fd, |ctx: &mut Ctx, _rx, c: Completion| {
      if let OpResult::Read(bytes) = c.result {
        ctx.reads.push(bytes);
      }
    });
    rx.timeout(Duration::from_millis(5), move |_ctx: &mut Ctx, _rx, _c| {
      let _ = sys::write(write_fd, b"ring");
    });
    rx.run(RunMode::UntilDone, &mut ctx);

    assert_eq!(ctx.reads, vec![b"ring".to_vec()]);
    sys::close(read_fd);
    sys::close(write_fd);
  }

  #[test]
  fn canceled_read_reports_canceled_once() {
    let Some(rx) = reactor() else { return };
    let mut ctx = Ctx::default();
    let (read_fd, write_fd) = unix_pipe();

    let id = rx.read(read_fd, |ctx: &mut Ctx, _rx, c: Completion| {
      if matches!(c.result, OpResult::Err(ErrorKind::Canceled)) {
        ctx.canceled += 1;
      }
    });
    rx.cancel(id);
    rx.run(RunMode::UntilDone, &mut ctx);

    assert_eq!(ctx.canceled, 1);
    sys::close(read_fd);
    sys::close(write_fd);
  }
}
