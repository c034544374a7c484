//! Dirty-pipe signalling between a reader worker and the reactor.
//!
//! The worker writes single bytes into a non-blocking pipe; the pipe's read
//! end is registered with the reactor, and its readability is the only way
//! terminal updates reach the main thread. The pipe byte doubles as the
//! happens-before edge publishing the worker's `Terminal` mutations.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;
use mio::unix::pipe;

/// Regular "screen changed" signal.
pub const DIRTY_BYTE: u8 = 0x01;
/// Terminal signal: the worker saw EOF or a fatal read error and is gone.
pub const EXIT_BYTE: u8 = 0x02;

/// Write end, owned by the reader worker.
pub struct DirtySender {
  tx: pipe::Sender,
}

impl DirtySender {
  /// Signals a screen change. A full pipe already carries a pending signal,
  /// so would-block is silently ignored.
  pub fn dirty(&mut self) {
    self.send(DIRTY_BYTE);
  }

  /// Signals worker exit.
  pub fn exit(&mut self) {
    self.send(EXIT_BYTE);
  }

  fn send(&mut self, byte: u8) {
    match self.tx.write(&[byte]) {
      Ok(_) => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
      Err(err) => debug!("dirty pipe write failed: {err}"),
    }
  }
}

/// Read end, owned by the session on the main thread.
pub struct DirtyReceiver {
  rx: pipe::Receiver,
}

/// Outcome of draining the pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drain {
  pub dirty: bool,
  pub exit: bool,
}

impl DirtyReceiver {
  #[must_use]
  pub fn fd(&self) -> RawFd {
    self.rx.as_raw_fd()
  }

  /// Reads until would-block, folding in `head` bytes the reactor already
  /// pulled off the pipe for this wakeup.
  pub fn drain(&mut self, head: &[u8]) -> Drain {
    let mut result = Drain::default();
    let mut note = |bytes: &[u8]| {
      for b in bytes {
        match *b {
          EXIT_BYTE => result.exit = true,
          _ => result.dirty = true,
        }
      }
    };
    note(head);
    let mut scratch = [0u8; 512];
    loop {
      match self.rx.read(&mut scratch) {
        Ok(0) => {
          result.exit = true;
          break;
        }
        Ok(n) => note(&scratch[..n]),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => {
          debug!("dirty pipe read failed: {err}");
          result.exit = true;
          break;
        }
      }
    }
    result
  }
}

/// Creates the non-blocking signalling pipe.
pub fn dirty_pipe() -> io::Result<(DirtySender, DirtyReceiver)> {
  let (tx, rx) = pipe::new()?;
  Ok((DirtySender { tx }, DirtyReceiver { rx }))
}
