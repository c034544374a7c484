//! Frame scheduler: couples per-pty dirty signals to rate-limited renders.
//!
//! Producers (reader workers) signal at arbitrary rates; the consumer
//! renders at most once per [`MIN_FRAME_INTERVAL`] per session. A dirty
//! signal inside the clamp window arms a single render timer for the
//! remainder of the window, so a lone signal still renders by
//! `t + MIN_FRAME_INTERVAL` and a flood renders at the interval ceiling.

use std::time::{Duration, Instant};

use log::debug;

use crate::msgpack::Value;
use crate::reactor::{Completion, OpResult};
use crate::rpc::{Message, OutboundKind};
use crate::server::{Rx, ServerState, send_to_client};

/// Minimum time between renders of one session (125 Hz ceiling).
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(8);

/// What to do with a dirty signal arriving at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPlan {
  Immediate,
  /// Render when the clamp window ends.
  Defer(Duration),
  /// A render timer is already armed; the signal is absorbed by it.
  Absorbed,
}

/// Pure pacing decision, kept separate from reactor plumbing so the clamp
/// law is testable on synthetic clocks.
#[must_use]
pub fn plan_render(
  now: Instant,
  last_render: Instant,
  timer_armed: bool,
  interval: Duration,
) -> RenderPlan {
  if timer_armed {
    return RenderPlan::Absorbed;
  }
  let elapsed = now.saturating_duration_since(last_render);
  if elapsed >= interval {
    RenderPlan::Immediate
  } else {
    RenderPlan::Defer(interval - elapsed)
  }
}

/// Arms the dirty-pipe read for a session.
pub fn arm_pipe_read(rx: &Rx, session: &mut crate::pty::PtySession) {
  let sid = session.id;
  let fd = session.pipe_fd();
  let task = rx.read(fd, move |st, rx, c| on_pipe_readable(st, rx, sid, c));
  session.pipe_read_task = Some(task);
}

fn on_pipe_readable(st: &mut ServerState, rx: &Rx, sid: u64, c: Completion) {
  let Some(session) = st.sessions.get_mut(&sid) else {
    return;
  };
  session.pipe_read_task = None;
  let head = match c.result {
    OpResult::Read(bytes) if !bytes.is_empty() => bytes,
    // EOF or error on the signalling pipe means the worker is gone even if
    // its exit byte got lost.
    OpResult::Read(_) => {
      crate::server::destroy_session(st, rx, sid);
      return;
    }
    OpResult::Err(crate::reactor::ErrorKind::Canceled) => return,
    other => {
      debug!("session {sid}: dirty pipe read failed: {other:?}");
      crate::server::destroy_session(st, rx, sid);
      return;
    }
  };

  let drain = session.drain_dirty(&head);
  if drain.exit {
    crate::server::destroy_session(st, rx, sid);
    return;
  }
  if drain.dirty {
    schedule_render(st, rx, sid);
  }
  if let Some(session) = st.sessions.get_mut(&sid) {
    arm_pipe_read(rx, session);
  }
}

/// Applies the pacing decision for a dirty signal on `sid`.
pub fn schedule_render(st: &mut ServerState, rx: &Rx, sid: u64) {
  let interval = st.min_frame_interval;
  let now = rx.now();
  let Some(session) = st.sessions.get_mut(&sid) else {
    return;
  };
  match plan_render(now, session.last_render_time, session.render_timer.is_some(), interval) {
    RenderPlan::Absorbed => {}
    RenderPlan::Immediate => render(st, rx, sid),
    RenderPlan::Defer(delay) => {
      let task = rx.timeout(delay, move |st, rx, c| {
        let Some(session) = st.sessions.get_mut(&sid) else {
          return;
        };
        session.render_timer = None;
        if matches!(c.result, OpResult::TimedOut) {
          render(st, rx, sid);
        }
      });
      session.render_timer = Some(task);
    }
  }
}

/// Snapshots the terminal and queues a `redraw` to every attached client,
/// plus `title`/`bell` notifications when those changed since the last
/// render. Advances the session's pacing clock.
pub fn render(st: &mut ServerState, rx: &Rx, sid: u64) {
  let Some(session) = st.sessions.get_mut(&sid) else {
    return;
  };
  session.last_render_time = rx.now();
  if session.clients.is_empty() {
    // Output is consumed and parsed regardless; only rendering is skipped.
    return;
  }
  let frame = session.frame();
  let title = session.title();
  let bell_count = session.bell_count();
  let title_changed = title != session.last_title;
  let bell_rang = bell_count > session.last_bell;
  session.last_title = title.clone();
  session.last_bell = bell_count;
  let clients: Vec<u64> = session.clients.iter().copied().collect();

  let redraw = Message::notification("redraw", vec![Value::Uint(sid), frame.to_value()]);
  let title_note = title_changed
    .then(|| Message::notification("title", vec![Value::Uint(sid), Value::Str(title)]));
  let bell_note = bell_rang.then(|| Message::notification("bell", vec![Value::Uint(sid)]));

  for client_id in clients {
    send_to_client(st, rx, client_id, &redraw, OutboundKind::Redraw { session: sid });
    if let Some(note) = &title_note {
      send_to_client(st, rx, client_id, note, OutboundKind::Other);
    }
    if let Some(note) = &bell_note {
      send_to_client(st, rx, client_id, note, OutboundKind::Other);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Clamp law: a dirty stream far above the frame rate renders at most
  /// once per interval, plus the eager first frame and the deferred tail.
  #[test]
  fn flood_of_signals_is_clamped_to_interval() {
    let interval = Duration::from_millis(8);
    let start = Instant::now();
    let mut now = start;
    let mut last_render = start - Duration::from_secs(1);
    let mut timer_deadline: Option<Instant> = None;
    let mut renders = 0u32;

    // 1000 dirty signals over 50 ms (one every 50 µs), timers firing as
    // their deadlines pass.
    for _ in 0..1000 {
      now += Duration::from_micros(50);
      if let Some(deadline) = timer_deadline
        && now >= deadline
      {
        timer_deadline = None;
        renders += 1;
        last_render = deadline;
      }
      match plan_render(now, last_render, timer_deadline.is_some(), interval) {
        RenderPlan::Immediate => {
          renders += 1;
          last_render = now;
        }
        RenderPlan::Defer(delay) => timer_deadline = Some(now + delay),
        RenderPlan::Absorbed => {}
      }
    }
    if timer_deadline.is_some() {
      renders += 1;
    }

    // 50 ms / 8 ms = 6.25 → at most ⌊T/I⌋ + eager first + pending tail.
    assert!(renders >= 6, "renders = {renders}");
    assert!(renders <= 8, "renders = {renders}");
  }

  /// A single dirty signal renders no later than one interval after it.
  #[test]
  fn single_signal_renders_within_interval() {
    let interval = Duration::from_millis(8);
    let start = Instant::now();
    // Quiet session, last render long ago: immediate.
    assert_eq!(
      plan_render(start, start - Duration::from_secs(1), false, interval),
      RenderPlan::Immediate
    );
    // Busy session, 3 ms into the window: deferred by the remaining 5 ms.
    let plan = plan_render(
      start + Duration::from_millis(3),
      start,
      false,
      interval,
    );
    assert_eq!(plan, RenderPlan::Defer(Duration::from_millis(5)));
  }

  #[test]
  fn signals_inside_an_armed_window_are_absorbed() {
    let interval = Duration::from_millis(8);
    let start = Instant::now();
    assert_eq!(
      plan_render(start + Duration::from_millis(1), start, true, interval),
      RenderPlan::Absorbed
    );
  }
}
