//! Per-client RPC session state machine.
//!
//! The session owns the two byte buffers of a client connection and nothing
//! else; arming reads and writes on the reactor is the server's job. Keeping
//! the state machine free of I/O makes the framing, coalescing, and
//! back-pressure rules testable in isolation.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::msgpack::DecodeError;
use crate::rpc::message::{self, Message};

/// Outbound queue cap before redraw shedding kicks in.
pub const OUTBOUND_CAP: usize = 16 * 1024 * 1024;

/// Upper bound for one coalesced write submission.
const WRITE_CHUNK: usize = 256 * 1024;

/// Classification of a queued outbound message for back-pressure shedding.
/// Full-frame redraws are idempotent, so older ones for the same session can
/// be dropped as long as the newest survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
  Redraw { session: u64 },
  Other,
}

struct Outgoing {
  bytes: Vec<u8>,
  kind: OutboundKind,
}

/// What `push` tells the caller about the queue after back-pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
  Queued,
  /// Shedding could not bring the queue under the cap; close the client.
  Overflow,
}

/// A server-initiated request waiting for its response.
pub struct PendingRequest {
  pub method: String,
}

pub struct RpcSession {
  inbound: Vec<u8>,
  consumed: usize,
  queue: VecDeque<Outgoing>,
  queued_bytes: usize,
  /// Copy of the chunk currently submitted to the reactor, kept so a short
  /// write can re-queue its tail.
  inflight: Option<Vec<u8>>,
  /// Tail of a partially written chunk; always flushed before the queue.
  inflight_rest: Option<Vec<u8>>,
  next_request_id: u32,
  pending: HashMap<u32, PendingRequest>,
}

impl Default for RpcSession {
  fn default() -> Self {
    Self::new()
  }
}

impl RpcSession {
  #[must_use]
  pub fn new() -> Self {
    Self {
      inbound: Vec::new(),
      consumed: 0,
      queue: VecDeque::new(),
      queued_bytes: 0,
      inflight: None,
      inflight_rest: None,
      next_request_id: 0,
      pending: HashMap::new(),
    }
  }

  /// Appends bytes received from the socket.
  pub fn feed(&mut self, bytes: &[u8]) {
    self.inbound.extend_from_slice(bytes);
  }

  /// Decodes the next complete message from the inbound buffer.
  ///
  /// `Ok(None)` means the buffer holds at most a truncated message and the
  /// read should be re-armed. A decode error is a protocol violation; the
  /// caller closes the session.
  pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
    match message::decode_one(&self.inbound[self.consumed..])? {
      Some((msg, used)) => {
        self.consumed += used;
        if self.consumed >= 64 * 1024 || self.consumed == self.inbound.len() {
          self.inbound.drain(..self.consumed);
          self.consumed = 0;
        }
        Ok(Some(msg))
      }
      None => Ok(None),
    }
  }

  /// Queues a message for sending, applying the redraw-shedding policy when
  /// the queue exceeds [`OUTBOUND_CAP`].
  pub fn push(&mut self, msg: &Message, kind: OutboundKind) -> SessionEvent {
    let bytes = msg.encode();
    self.queued_bytes += bytes.len();
    self.queue.push_back(Outgoing { bytes, kind });
    if self.queued_bytes <= OUTBOUND_CAP {
      return SessionEvent::Queued;
    }
    self.shed_redraws();
    if self.queued_bytes > OUTBOUND_CAP {
      SessionEvent::Overflow
    } else {
      SessionEvent::Queued
    }
  }

  /// Drops every queued redraw that has a newer redraw for the same session
  /// behind it in the queue.
  fn shed_redraws(&mut self) {
    let mut newest: HashMap<u64, usize> = HashMap::new();
    for (idx, out) in self.queue.iter().enumerate() {
      if let OutboundKind::Redraw { session } = out.kind {
        newest.insert(session, idx);
      }
    }
    let mut dropped = 0usize;
    let mut idx = 0usize;
    self.queue.retain(|out| {
      let keep = match out.kind {
        OutboundKind::Redraw { session } => newest.get(&session) == Some(&idx),
        OutboundKind::Other => true,
      };
      if !keep {
        dropped += out.bytes.len();
      }
      idx += 1;
      keep
    });
    if dropped > 0 {
      debug!("shed {dropped} bytes of stale redraws under back-pressure");
      self.queued_bytes -= dropped;
    }
  }

  /// True when a write should be scheduled (data waiting, none in flight).
  #[must_use]
  pub fn wants_write(&self) -> bool {
    self.inflight.is_none() && (self.inflight_rest.is_some() || !self.queue.is_empty())
  }

  /// Takes the next coalesced chunk to submit and marks a write in flight.
  /// The session keeps its own copy until [`RpcSession::write_complete`]
  /// accounts for it.
  pub fn take_write_chunk(&mut self) -> Option<Vec<u8>> {
    if self.inflight.is_some() {
      return None;
    }
    let mut chunk = self.inflight_rest.take().unwrap_or_default();
    while chunk.len() < WRITE_CHUNK {
      let Some(front) = self.queue.pop_front() else {
        break;
      };
      self.queued_bytes -= front.bytes.len();
      chunk.extend_from_slice(&front.bytes);
    }
    if chunk.is_empty() {
      return None;
    }
    self.inflight = Some(chunk.clone());
    Some(chunk)
  }

  /// Accounts for a completed write of `written` bytes of the in-flight
  /// chunk; a short write re-queues the tail ahead of everything else.
  pub fn write_complete(&mut self, written: usize) {
    let Some(chunk) = self.inflight.take() else {
      return;
    };
    if written < chunk.len() {
      self.inflight_rest = Some(chunk[written..].to_vec());
    }
  }

  /// Allocates a request id for a server-initiated request. Ids wrap at
  /// 2³² and are never reused while still pending.
  pub fn begin_request(&mut self, method: &str) -> u32 {
    loop {
      let id = self.next_request_id;
      self.next_request_id = self.next_request_id.wrapping_add(1);
      if !self.pending.contains_key(&id) {
        self.pending.insert(
          id,
          PendingRequest {
            method: method.to_string(),
          },
        );
        return id;
      }
    }
  }

  /// Resolves a pending request; `None` means the response id was unknown.
  pub fn take_pending(&mut self, id: u32) -> Option<PendingRequest> {
    self.pending.remove(&id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::msgpack::Value;

  #[test]
  fn frames_across_partial_feeds() {
    let msg = Message::request(1, "attach", vec![Value::Uint(4)]);
    let bytes = msg.encode();

    let mut s = RpcSession::new();
    s.feed(&bytes[..3]);
    assert!(s.next_message().unwrap().is_none());
    s.feed(&bytes[3..]);
    assert_eq!(s.next_message().unwrap(), Some(msg));
    assert!(s.next_message().unwrap().is_none());
  }

  #[test]
  fn two_messages_one_feed() {
    let a = Message::notification("bell", vec![Value::Uint(1)]);
    let b = Message::notification("bell", vec![Value::Uint(2)]);
    let mut s = RpcSession::new();
    s.feed(&a.encode());
    s.feed(&b.encode());
    assert_eq!(s.next_message().unwrap(), Some(a));
    assert_eq!(s.next_message().unwrap(), Some(b));
    assert!(s.next_message().unwrap().is_none());
  }

  #[test]
  fn malformed_input_is_an_error() {
    let mut s = RpcSession::new();
    s.feed(&[0xc1, 0x00]);
    assert!(s.next_message().is_err());
  }

  #[test]
  fn write_coalescing_and_short_writes() {
    let mut s = RpcSession::new();
    let a = Message::notification("title", vec![Value::Str("one".into())]);
    let b = Message::notification("title", vec![Value::Str("two".into())]);
    s.push(&a, OutboundKind::Other);
    s.push(&b, OutboundKind::Other);

    assert!(s.wants_write());
    let chunk = s.take_write_chunk().expect("chunk");
    assert_eq!(chunk.len(), a.encode().len() + b.encode().len());
    assert!(!s.wants_write(), "write is in flight");

    // Short write: the remainder must come back before anything new.
    let total = chunk.len();
    s.write_complete(total - 5);
    assert!(s.wants_write());
    let rest = s.take_write_chunk().expect("remainder");
    assert_eq!(rest.len(), 5);
    s.write_complete(5);
    assert!(!s.wants_write());
  }

  #[test]
  fn backpressure_sheds_stale_redraws_keeping_newest() {
    let mut s = RpcSession::new();
    // Fill the queue past the cap with redraws for session 1, plus one
    // notification that must survive.
    let keep = Message::notification("pty_exited", vec![Value::Uint(1)]);
    s.push(&keep, OutboundKind::Other);

    let big = Message::notification(
      "redraw",
      vec![Value::Uint(1), Value::Bin(vec![0u8; 4 * 1024 * 1024])],
    );
    for _ in 0..4 {
      assert_eq!(
        s.push(&big, OutboundKind::Redraw { session: 1 }),
        SessionEvent::Queued
      );
    }

    // Everything left fits well under the cap: one redraw plus the keeper.
    let mut chunks = Vec::new();
    while let Some(c) = s.take_write_chunk() {
      let len = c.len();
      chunks.push(c);
      s.write_complete(len);
    }
    let total: usize = chunks.iter().map(Vec::len).sum();
    assert!(total <= OUTBOUND_CAP);
    assert!(total >= big.encode().len());
  }

  #[test]
  fn backpressure_overflow_when_shedding_cannot_help() {
    let mut s = RpcSession::new();
    let big = Message::notification(
      "redraw",
      vec![Value::Uint(1), Value::Bin(vec![0u8; 6 * 1024 * 1024])],
    );
    // Distinct sessions: the newest of each must be kept, so shedding
    // cannot reclaim enough.
    assert_eq!(
      s.push(&big, OutboundKind::Redraw { session: 1 }),
      SessionEvent::Queued
    );
    assert_eq!(
      s.push(&big, OutboundKind::Redraw { session: 2 }),
      SessionEvent::Queued
    );
    assert_eq!(
      s.push(&big, OutboundKind::Redraw { session: 3 }),
      SessionEvent::Overflow
    );
  }

  #[test]
  fn request_ids_wrap_and_skip_pending() {
    let mut s = RpcSession::new();
    s.next_request_id = u32::MAX;
    let a = s.begin_request("ping");
    assert_eq!(a, u32::MAX);
    let b = s.begin_request("ping");
    assert_eq!(b, 0);
    assert!(s.take_pending(a).is_some());
    assert!(s.take_pending(a).is_none());
  }
}
