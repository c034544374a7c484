//! The per-session blocking reader worker.
//!
//! One thread per pty. It is the only writer to the session's `Terminal`;
//! the main thread reads terminal state only after observing a dirty-pipe
//! byte. Parser reply streams are tiny and synchronous, so the worker
//! writes them straight back to the pty master instead of hopping through
//! the reactor.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use log::debug;
use parking_lot::Mutex;

use crate::pty::pipe::DirtySender;
use crate::term::Terminal;

const READ_BUF: usize = 64 * 1024;

pub fn spawn(
  session_id: u64,
  mut source: Box<dyn Read + Send>,
  term: Arc<Mutex<Box<dyn Terminal + Send>>>,
  mut reply: Box<dyn Write + Send>,
  mut signal: DirtySender,
) -> anyhow::Result<JoinHandle<()>> {
  std::thread::Builder::new()
    .name(format!("pty-reader-{session_id}"))
    .spawn(move || {
      let mut buf = vec![0u8; READ_BUF];
      loop {
        match source.read(&mut buf) {
          Ok(0) => {
            debug!("pty {session_id}: eof");
            signal.exit();
            break;
          }
          Err(err) if err.kind() == ErrorKind::Interrupted => {}
          Err(err) => {
            debug!("pty {session_id}: read failed: {err}");
            signal.exit();
            break;
          }
          Ok(n) => {
            let replies = term.lock().advance(&buf[..n]);
            if !replies.is_empty() {
              let _ = reply.write_all(&replies);
              let _ = reply.flush();
            }
            signal.dirty();
          }
        }
      }
    })
    .context("spawn pty reader thread")
}
