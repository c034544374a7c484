//! The server event core.
//!
//! Owns the flat id-keyed tables of pty sessions and clients, the RPC
//! method dispatch, the script bridge, and the accept loop. Everything here
//! runs on the reactor's thread; the only other threads in the process are
//! the per-session reader workers, which communicate exclusively through
//! their dirty pipes.
//!
//! Ownership is deliberately cycle-free: sessions and clients live in their
//! own maps and refer to each other by id, so destruction is always
//! id-driven. Destroying either side cancels its reactor ops first, which
//! bounds teardown to one loop iteration.

pub mod scheduler;
pub mod socket;

use std::collections::{HashMap, HashSet};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use crate::keys::{KeyEvent, encode_key};
use crate::msgpack::Value;
use crate::pty::{PtySession, SpawnOptions};
use crate::reactor::{Completion, ErrorKind, OpResult, Reactor, RunMode};
use crate::rpc::{Message, OutboundKind, RpcSession, SessionEvent};
use crate::script::{
  LogLevel, PtyRef, Script, ScriptAction, ScriptEvent, ScriptHost,
};

pub type Rx = Reactor<ServerState>;

/// Grace period between `quit` and reactor stop, letting queued responses
/// and `pty_exited` notifications flush.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

pub struct ServerOptions {
  pub socket_path: PathBuf,
  pub min_frame_interval: Duration,
  pub default_shell: Vec<String>,
  pub script: Box<dyn Script>,
}

pub struct ClientConn {
  pub id: u64,
  pub fd: RawFd,
  pub rpc: RpcSession,
  /// Session ids this client subscribes to.
  pub attached: HashSet<u64>,
}

pub struct ServerState {
  pub sessions: HashMap<u64, PtySession>,
  pub clients: HashMap<u64, ClientConn>,
  next_session_id: u64,
  next_client_id: u64,
  script: Box<dyn Script>,
  /// Script timer token → reactor task.
  script_timers: HashMap<u64, crate::reactor::TaskId>,
  /// Session targeted by the key event currently being bridged.
  focus: Option<u64>,
  listener_fd: RawFd,
  pub min_frame_interval: Duration,
  default_shell: Vec<String>,
  shutting_down: bool,
}

/// Read-only view handed to scripts for synchronous queries.
struct HostView<'a> {
  sessions: &'a HashMap<u64, PtySession>,
  focus: Option<u64>,
}

impl ScriptHost for HostView<'_> {
  fn pty_id(&self, pty: PtyRef) -> u64 {
    pty.0
  }

  fn pty_title(&self, pty: PtyRef) -> Option<String> {
    self.sessions.get(&pty.0).map(PtySession::title)
  }

  fn focused_pty(&self) -> Option<PtyRef> {
    self.focus.map(PtyRef)
  }
}

/// Runs the server until `quit` or an external stop. Blocking; owns the
/// calling thread as the reactor thread.
pub fn run(options: ServerOptions) -> anyhow::Result<()> {
  let rx: Rx = Reactor::new().context("create reactor")?;
  let listener = socket::bind_listener(&options.socket_path)?;
  let listener_fd = listener.into_raw_fd();

  let mut state = ServerState {
    sessions: HashMap::new(),
    clients: HashMap::new(),
    next_session_id: 1,
    next_client_id: 1,
    script: options.script,
    script_timers: HashMap::new(),
    focus: None,
    listener_fd,
    min_frame_interval: options.min_frame_interval,
    default_shell: options.default_shell,
    shutting_down: false,
  };

  arm_accept(&rx, listener_fd);
  rx.run(RunMode::Forever, &mut state);

  // Drain: kill children, join workers, close fds, unlink the socket.
  let sids: Vec<u64> = state.sessions.keys().copied().collect();
  for sid in sids {
    if let Some(mut session) = state.sessions.remove(&sid) {
      session.kill();
      session.join_worker();
    }
  }
  crate::reactor::sys::close(listener_fd);
  let _ = std::fs::remove_file(&options.socket_path);
  info!("server stopped");
  Ok(())
}

fn arm_accept(rx: &Rx, fd: RawFd) {
  rx.accept(fd, move |st: &mut ServerState, rx, c| match c.result {
    OpResult::Accepted(conn) => {
      on_accept(st, rx, conn);
      if !st.shutting_down {
        arm_accept(rx, fd);
      }
    }
    OpResult::Err(ErrorKind::Canceled) => {}
    other => {
      warn!("accept failed: {other:?}");
      // Back off instead of hot-looping on a persistent accept error.
      rx.timeout(Duration::from_millis(200), move |st: &mut ServerState, rx, _c| {
        if !st.shutting_down {
          arm_accept(rx, fd);
        }
      });
    }
  });
}

fn on_accept(st: &mut ServerState, rx: &Rx, fd: RawFd) {
  let id = st.next_client_id;
  st.next_client_id += 1;
  info!("client {id} connected");
  st.clients.insert(
    id,
    ClientConn {
      id,
      fd,
      rpc: RpcSession::new(),
      attached: HashSet::new(),
    },
  );
  arm_client_read(rx, id, fd);
}

fn arm_client_read(rx: &Rx, client_id: u64, fd: RawFd) {
  rx.read(fd, move |st: &mut ServerState, rx, c| {
    on_client_read(st, rx, client_id, fd, c);
  });
}

fn on_client_read(st: &mut ServerState, rx: &Rx, client_id: u64, fd: RawFd, c: Completion) {
  if !st.clients.contains_key(&client_id) {
    return;
  }
  match c.result {
    OpResult::Read(bytes) if bytes.is_empty() => {
      close_client(st, rx, client_id, "eof");
    }
    OpResult::Read(bytes) => {
      if let Some(client) = st.clients.get_mut(&client_id) {
        client.rpc.feed(&bytes);
      }
      loop {
        let Some(client) = st.clients.get_mut(&client_id) else {
          return; // dispatch closed the client
        };
        match client.rpc.next_message() {
          Ok(Some(msg)) => dispatch_message(st, rx, client_id, msg),
          Ok(None) => break,
          Err(err) => {
            warn!("client {client_id}: protocol violation: {err}");
            close_client(st, rx, client_id, "protocol violation");
            return;
          }
        }
      }
      arm_client_read(rx, client_id, fd);
    }
    OpResult::Err(ErrorKind::Canceled) => {}
    OpResult::Err(kind) => {
      close_client(st, rx, client_id, &format!("read failed: {kind}"));
    }
    other => {
      debug!("client {client_id}: unexpected read completion {other:?}");
    }
  }
}

fn dispatch_message(st: &mut ServerState, rx: &Rx, client_id: u64, msg: Message) {
  match msg {
    Message::Request { id, method, params } => {
      let reply = handle_method(st, rx, client_id, &method, &params);
      let response = match reply {
        Ok(result) => Message::response_ok(id, result),
        Err(err) => Message::response_err(id, err),
      };
      send_to_client(st, rx, client_id, &response, OutboundKind::Other);
    }
    Message::Notification { method, params } => {
      if let Err(err) = handle_method(st, rx, client_id, &method, &params) {
        debug!("client {client_id}: notification {method} failed: {err}");
      }
    }
    Message::Response { id, .. } => {
      match st
        .clients
        .get_mut(&client_id)
        .and_then(|c| c.rpc.take_pending(id))
      {
        Some(pending) => debug!("client {client_id}: response for {}", pending.method),
        None => debug!("client {client_id}: dropping response with unknown id {id}"),
      }
    }
  }
}

fn param<'a>(params: &'a [Value], idx: usize, what: &str) -> Result<&'a Value, String> {
  params.get(idx).ok_or_else(|| format!("missing {what}"))
}

fn session_id_param(params: &[Value], idx: usize) -> Result<u64, String> {
  param(params, idx, "session id")?
    .as_u64()
    .ok_or_else(|| "session id must be an integer".to_string())
}

fn handle_method(
  st: &mut ServerState,
  rx: &Rx,
  client_id: u64,
  method: &str,
  params: &[Value],
) -> Result<Value, String> {
  match method {
    "attach" => {
      let sid = session_id_param(params, 0)?;
      attach_client(st, rx, client_id, sid)?;
      Ok(Value::Nil)
    }
    "detach" => {
      let sid = session_id_param(params, 0)?;
      if let Some(session) = st.sessions.get_mut(&sid) {
        session.clients.remove(&client_id);
      }
      if let Some(client) = st.clients.get_mut(&client_id) {
        client.attached.remove(&sid);
      }
      Ok(Value::Nil)
    }
    "spawn" => {
      let mut options = SpawnOptions::from_value(param(params, 0, "spawn options")?)
        .map_err(|err| format!("bad spawn options: {err}"))?;
      if options.argv.is_empty() {
        options.argv = st.default_shell.clone();
      }
      if options.argv.is_empty() {
        return Err("spawn requires argv and no default shell is configured".to_string());
      }
      if crate::pty::handle::resolve_program(&options.argv[0]).is_none() {
        return Err(format!("no such program: {}", options.argv[0]));
      }
      let sid = spawn_session(st, rx, &options).map_err(|err| format!("spawn failed: {err:#}"))?;
      attach_client(st, rx, client_id, sid)?;
      Ok(Value::Uint(sid))
    }
    "write" => {
      let sid = session_id_param(params, 0)?;
      let bytes = param(params, 1, "bytes")?
        .as_bytes()
        .ok_or_else(|| "bytes must be binary or string".to_string())?
        .to_vec();
      if !st.sessions.contains_key(&sid) {
        return Err(format!("no such session: {sid}"));
      }
      write_pty(st, rx, sid, bytes);
      Ok(Value::Nil)
    }
    "key" => {
      let sid = session_id_param(params, 0)?;
      let key = KeyEvent::from_value(param(params, 1, "key event")?)
        .map_err(|err| format!("bad key event: {err}"))?;
      if !st.sessions.contains_key(&sid) {
        return Err(format!("no such session: {sid}"));
      }
      st.focus = Some(sid);
      run_script(st, rx, ScriptEvent::KeyPress { key });
      st.focus = None;
      Ok(Value::Nil)
    }
    "resize" => {
      let sid = session_id_param(params, 0)?;
      let cols = param(params, 1, "cols")?
        .as_u16()
        .ok_or_else(|| "cols must fit u16".to_string())?;
      let rows = param(params, 2, "rows")?
        .as_u16()
        .ok_or_else(|| "rows must fit u16".to_string())?;
      let session = st
        .sessions
        .get_mut(&sid)
        .ok_or_else(|| format!("no such session: {sid}"))?;
      session
        .resize(cols, rows)
        .map_err(|err| format!("resize failed: {err:#}"))?;
      run_script(st, rx, ScriptEvent::Winsize { cols, rows });
      scheduler::render(st, rx, sid);
      Ok(Value::Nil)
    }
    "list_sessions" => {
      let mut out: Vec<Value> = Vec::new();
      let mut ids: Vec<u64> = st.sessions.keys().copied().collect();
      ids.sort_unstable();
      for sid in ids {
        let session = &st.sessions[&sid];
        out.push(Value::Map(vec![
          ("id".into(), Value::Uint(sid)),
          ("title".into(), Value::Str(session.title())),
          ("cols".into(), session.cols.into()),
          ("rows".into(), session.rows.into()),
        ]));
      }
      Ok(Value::Array(out))
    }
    "kill" => {
      let sid = session_id_param(params, 0)?;
      let session = st
        .sessions
        .get_mut(&sid)
        .ok_or_else(|| format!("no such session: {sid}"))?;
      session.kill();
      Ok(Value::Nil)
    }
    "quit" => {
      begin_shutdown(st, rx);
      Ok(Value::Nil)
    }
    other => Err(format!("unknown method: {other}")),
  }
}

fn attach_client(
  st: &mut ServerState,
  rx: &Rx,
  client_id: u64,
  sid: u64,
) -> Result<(), String> {
  let session = st
    .sessions
    .get_mut(&sid)
    .ok_or_else(|| format!("no such session: {sid}"))?;
  session.clients.insert(client_id);
  if let Some(client) = st.clients.get_mut(&client_id) {
    client.attached.insert(sid);
  }
  // The new subscriber gets the current screen without waiting for the
  // next dirty signal. Deferred one reactor tick so the triggering
  // request's response hits the wire first.
  rx.timeout(Duration::ZERO, move |st: &mut ServerState, rx, _c| {
    let still_attached = st
      .sessions
      .get(&sid)
      .is_some_and(|s| s.clients.contains(&client_id));
    if !still_attached {
      return;
    }
    let frame = st.sessions[&sid].frame();
    let redraw = Message::notification("redraw", vec![Value::Uint(sid), frame.to_value()]);
    send_to_client(st, rx, client_id, &redraw, OutboundKind::Redraw { session: sid });
  });
  run_script(st, rx, ScriptEvent::PtyAttach { pty: PtyRef(sid) });
  Ok(())
}

fn spawn_session(st: &mut ServerState, rx: &Rx, options: &SpawnOptions) -> anyhow::Result<u64> {
  let sid = st.next_session_id;
  st.next_session_id += 1;
  let mut session = PtySession::spawn(sid, options, rx.now())?;
  scheduler::arm_pipe_read(rx, &mut session);
  info!("session {sid} spawned: {:?}", options.argv);
  st.sessions.insert(sid, session);
  Ok(sid)
}

/// Tears a session down after its worker exited (EOF, error, or kill).
/// Order matters: cancel reactor ops on the session's fds before joining
/// the worker and dropping (closing) the fds.
pub(crate) fn destroy_session(st: &mut ServerState, rx: &Rx, sid: u64) {
  if !st.sessions.contains_key(&sid) {
    return;
  }
  // Output parsed since the last render would otherwise be lost: the exit
  // byte often lands in the same drain as the final dirty signal, and any
  // pending render timer is about to be canceled. One last unclamped frame.
  scheduler::render(st, rx, sid);
  let Some(mut session) = st.sessions.remove(&sid) else {
    return;
  };
  if let Some(timer) = session.render_timer.take() {
    rx.cancel(timer);
  }
  rx.cancel_by_fd(session.pipe_fd());
  rx.cancel_by_fd(session.handle.fd());
  session.join_worker();
  let status = session.exit_status();
  let clients: Vec<u64> = session.clients.iter().copied().collect();
  info!("session {sid} exited: {status:?}");
  drop(session); // closes pty and pipe fds

  let status_value = status.map_or(Value::Nil, |s| Value::Uint(u64::from(s.exit_code())));
  let note = Message::notification("pty_exited", vec![Value::Uint(sid), status_value]);
  for client_id in clients {
    if let Some(client) = st.clients.get_mut(&client_id) {
      client.attached.remove(&sid);
    }
    send_to_client(st, rx, client_id, &note, OutboundKind::Other);
  }
  run_script(st, rx, ScriptEvent::PtyExited { id: sid });
}

/// Queues a message on a client's RPC session and pumps the write side.
pub(crate) fn send_to_client(
  st: &mut ServerState,
  rx: &Rx,
  client_id: u64,
  msg: &Message,
  kind: OutboundKind,
) {
  let Some(client) = st.clients.get_mut(&client_id) else {
    return;
  };
  match client.rpc.push(msg, kind) {
    SessionEvent::Queued => pump_client_write(st, rx, client_id),
    SessionEvent::Overflow => {
      close_client(st, rx, client_id, "outbound buffer overflow");
    }
  }
}

fn pump_client_write(st: &mut ServerState, rx: &Rx, client_id: u64) {
  let Some(client) = st.clients.get_mut(&client_id) else {
    return;
  };
  if !client.rpc.wants_write() {
    return;
  }
  let Some(chunk) = client.rpc.take_write_chunk() else {
    return;
  };
  let fd = client.fd;
  rx.write(fd, chunk, move |st: &mut ServerState, rx, c| {
    let Some(client) = st.clients.get_mut(&client_id) else {
      return;
    };
    match c.result {
      OpResult::Wrote(n) => {
        client.rpc.write_complete(n);
        pump_client_write(st, rx, client_id);
      }
      OpResult::Err(ErrorKind::Canceled) => {}
      OpResult::Err(kind) => {
        close_client(st, rx, client_id, &format!("write failed: {kind}"));
      }
      other => debug!("client {client_id}: unexpected write completion {other:?}"),
    }
  });
}

/// Removes a client: cancel its reactor ops, close the socket, and detach
/// it from every session. Sessions keep running with zero subscribers.
fn close_client(st: &mut ServerState, rx: &Rx, client_id: u64, reason: &str) {
  let Some(mut client) = st.clients.remove(&client_id) else {
    return;
  };
  info!("client {client_id} closed: {reason}");
  rx.cancel_by_fd(client.fd);
  rx.close(client.fd, |_st, _rx, _c| {});
  for sid in client.attached.drain() {
    if let Some(session) = st.sessions.get_mut(&sid) {
      session.clients.remove(&client_id);
    }
  }
}

fn write_pty(st: &mut ServerState, rx: &Rx, sid: u64, bytes: Vec<u8>) {
  if bytes.is_empty() {
    return;
  }
  let Some(session) = st.sessions.get(&sid) else {
    return;
  };
  let fd = session.handle.fd();
  let retry = bytes.clone();
  rx.write(fd, bytes, move |st: &mut ServerState, rx, c| match c.result {
    OpResult::Wrote(n) if n < retry.len() => {
      write_pty(st, rx, sid, retry[n..].to_vec());
    }
    OpResult::Wrote(_) | OpResult::Err(ErrorKind::Canceled) => {}
    OpResult::Err(kind) => debug!("session {sid}: pty write failed: {kind}"),
    other => debug!("session {sid}: unexpected pty write completion {other:?}"),
  });
}

/// Enters the script with one event and applies the returned actions. A
/// script error discards the actions and nothing else.
pub(crate) fn run_script(st: &mut ServerState, rx: &Rx, event: ScriptEvent) {
  let actions = {
    let host = HostView {
      sessions: &st.sessions,
      focus: st.focus,
    };
    match st.script.dispatch(event, &host) {
      Ok(actions) => actions,
      Err(err) => {
        warn!("script error: {err:#}");
        return;
      }
    }
  };
  for action in actions {
    apply_action(st, rx, action);
  }
}

fn apply_action(st: &mut ServerState, rx: &Rx, action: ScriptAction) {
  match action {
    ScriptAction::Spawn { options } => {
      match spawn_session(st, rx, &options) {
        Ok(sid) => run_script(st, rx, ScriptEvent::PtyAttach { pty: PtyRef(sid) }),
        Err(err) => warn!("script spawn failed: {err:#}"),
      }
    }
    ScriptAction::SendKey { pty, key } => {
      write_pty(st, rx, pty.0, encode_key(&key));
    }
    ScriptAction::Write { pty, bytes } => {
      write_pty(st, rx, pty.0, bytes);
    }
    ScriptAction::RequestFrame { pty } => {
      scheduler::schedule_render(st, rx, pty.0);
    }
    ScriptAction::SetTimeout { ms, token } => {
      let task = rx.timeout(Duration::from_millis(ms), move |st: &mut ServerState, rx, c| {
        st.script_timers.remove(&token);
        if matches!(c.result, OpResult::TimedOut) {
          run_script(st, rx, ScriptEvent::Timer { token });
        }
      });
      st.script_timers.insert(token, task);
    }
    ScriptAction::CancelTimer { timer } => {
      if let Some(task) = st.script_timers.remove(&timer.0) {
        rx.cancel(task);
      }
    }
    ScriptAction::Quit => begin_shutdown(st, rx),
    ScriptAction::Log { level, message } => match level {
      LogLevel::Info => info!("script: {message}"),
      LogLevel::Warn => warn!("script: {message}"),
      LogLevel::Err => log::error!("script: {message}"),
    },
  }
}

/// Stops accepting, terminates children, and schedules the reactor stop
/// after a short flush window.
fn begin_shutdown(st: &mut ServerState, rx: &Rx) {
  if st.shutting_down {
    return;
  }
  st.shutting_down = true;
  info!("shutdown requested");
  rx.cancel_by_fd(st.listener_fd);
  let sids: Vec<u64> = st.sessions.keys().copied().collect();
  for sid in sids {
    if let Some(session) = st.sessions.get_mut(&sid) {
      session.kill();
    }
  }
  rx.timeout(SHUTDOWN_GRACE, |_st: &mut ServerState, rx, _c| {
    rx.stop();
  });
}
