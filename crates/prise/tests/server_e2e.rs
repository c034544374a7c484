//! End-to-end exercises against a live server on a temp socket.
//!
//! Each test boots the server on its own socket inside a temp dir and talks
//! raw MessagePack-RPC over a `UnixStream`, exactly like a real client.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serial_test::serial;

use prise::msgpack::Value;
use prise::rpc::message::{self, Message};
use prise::script::PassthroughScript;
use prise::server::{self, ServerOptions};

struct TestServer {
  pub socket: PathBuf,
  thread: Option<std::thread::JoinHandle<anyhow::Result<()>>>,
  _dir: tempfile::TempDir,
}

impl TestServer {
  fn start() -> Self {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("prise.sock");
    let path = socket.clone();
    let thread = std::thread::spawn(move || {
      server::run(ServerOptions {
        socket_path: path,
        min_frame_interval: Duration::from_millis(8),
        default_shell: vec!["/bin/sh".to_string()],
        script: Box::new(PassthroughScript::default()),
      })
    });
    // Wait for the listener to come up.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      if UnixStream::connect(&socket).is_ok() {
        return Self {
          socket,
          thread: Some(thread),
          _dir: dir,
        };
      }
      std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not come up");
  }

  fn join(mut self) -> anyhow::Result<()> {
    self
      .thread
      .take()
      .expect("server thread")
      .join()
      .expect("server thread panicked")
  }
}

struct Client {
  stream: UnixStream,
  inbound: Vec<u8>,
  consumed: usize,
  notifications: VecDeque<(String, Vec<Value>)>,
  next_id: u32,
}

impl Client {
  fn connect(server: &TestServer) -> Self {
    let stream = UnixStream::connect(&server.socket).expect("connect");
    stream
      .set_read_timeout(Some(Duration::from_millis(25)))
      .expect("read timeout");
    Self {
      stream,
      inbound: Vec::new(),
      consumed: 0,
      notifications: VecDeque::new(),
      next_id: 1,
    }
  }

  fn send(&mut self, msg: &Message) {
    self.stream.write_all(&msg.encode()).expect("send");
  }

  fn send_raw(&mut self, bytes: &[u8]) {
    self.stream.write_all(bytes).expect("send raw");
  }

  /// Reads one message, buffering partial frames, until `deadline`.
  fn recv(&mut self, deadline: Instant) -> Option<Message> {
    loop {
      match message::decode_one(&self.inbound[self.consumed..]).expect("well-formed stream") {
        Some((msg, used)) => {
          self.consumed += used;
          if self.consumed == self.inbound.len() {
            self.inbound.clear();
            self.consumed = 0;
          }
          return Some(msg);
        }
        None => {
          if Instant::now() >= deadline {
            return None;
          }
          let mut buf = [0u8; 64 * 1024];
          match self.stream.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
            Err(err)
              if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) => panic!("client read failed: {err}"),
          }
        }
      }
    }
  }

  /// Sends a request and waits for its response, queueing notifications
  /// that arrive in between.
  fn call(&mut self, method: &str, params: Vec<Value>) -> (Value, Value) {
    let id = self.next_id;
    self.next_id += 1;
    self.send(&Message::request(id, method, params));
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(msg) = self.recv(deadline) {
      match msg {
        Message::Response {
          id: got,
          error,
          result,
        } if got == id => return (error, result),
        Message::Notification { method, params } => {
          self.notifications.push_back((method, params));
        }
        _ => {}
      }
    }
    panic!("no response to {method}");
  }

  fn call_ok(&mut self, method: &str, params: Vec<Value>) -> Value {
    let (error, result) = self.call(method, params);
    assert!(error.is_nil(), "{method} failed: {error:?}");
    result
  }

  fn notify(&mut self, method: &str, params: Vec<Value>) {
    self.send(&Message::notification(method, params));
  }

  /// Next notification of the given method, from the queue or the wire.
  fn next_notification(&mut self, method: &str, timeout: Duration) -> Option<Vec<Value>> {
    if let Some(pos) = self.notifications.iter().position(|(m, _)| m == method) {
      return self.notifications.remove(pos).map(|(_, p)| p);
    }
    let deadline = Instant::now() + timeout;
    while let Some(msg) = self.recv(deadline) {
      if let Message::Notification { method: m, params } = msg {
        if m == method {
          return Some(params);
        }
        self.notifications.push_back((m, params));
      }
    }
    None
  }

  /// Closed when a read reports EOF.
  fn is_closed(&mut self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
      match self.stream.read(&mut buf) {
        Ok(0) => return true,
        Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
        Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
        Err(_) => return true,
      }
    }
    false
  }
}

fn spawn_params(argv: &[&str], cols: u16, rows: u16) -> Vec<Value> {
  vec![Value::Map(vec![
    (
      "argv".into(),
      Value::Array(argv.iter().map(|a| Value::Str((*a).to_string())).collect()),
    ),
    ("cols".into(), cols.into()),
    ("rows".into(), rows.into()),
  ])]
}

fn key_params(sid: u64, key: &str) -> Vec<Value> {
  vec![
    Value::Uint(sid),
    Value::Map(vec![
      ("key".into(), Value::Str(key.to_string())),
      ("ctrlKey".into(), Value::Bool(false)),
      ("shiftKey".into(), Value::Bool(false)),
      ("altKey".into(), Value::Bool(false)),
      ("metaKey".into(), Value::Bool(false)),
    ]),
  ]
}

fn frame_text(frame: &Value) -> String {
  let mut out = String::new();
  let rows = frame
    .get("cells")
    .and_then(Value::as_array)
    .expect("cells");
  for row in rows {
    for cell in row.as_array().expect("row") {
      out.push_str(cell.get("ch").and_then(Value::as_str).unwrap_or(""));
    }
    out.push('\n');
  }
  out
}

fn frame_cursor(frame: &Value) -> (u64, u64) {
  let cursor = frame.get("cursor").expect("cursor");
  (
    cursor.get("row").and_then(Value::as_u64).unwrap(),
    cursor.get("col").and_then(Value::as_u64).unwrap(),
  )
}

/// Waits for a redraw of `sid` whose grid satisfies `pred`.
fn wait_redraw(
  client: &mut Client,
  sid: u64,
  timeout: Duration,
  pred: impl Fn(&Value) -> bool,
) -> Option<Value> {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    let Some(params) = client.next_notification("redraw", Duration::from_millis(200)) else {
      continue;
    };
    if params.first().and_then(Value::as_u64) == Some(sid) && pred(&params[1]) {
      return Some(params[1].clone());
    }
  }
  None
}

#[test]
#[serial]
fn spawn_renders_output_then_reports_exit() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/sh", "-c", "echo hi"], 80, 24))
    .as_u64()
    .expect("session id");

  let frame = wait_redraw(&mut client, sid, Duration::from_secs(1), |frame| {
    frame_text(frame).contains("hi")
  });
  assert!(frame.is_some(), "no redraw containing the child's output");

  let exited = client
    .next_notification("pty_exited", Duration::from_secs(2))
    .expect("pty_exited");
  assert_eq!(exited[0].as_u64(), Some(sid));
  assert!(
    exited[1].as_u64() == Some(0) || exited[1].is_nil(),
    "unexpected exit status {:?}",
    exited[1]
  );
}

#[test]
#[serial]
fn key_passthrough_echoes_and_advances_cursor() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");

  client.notify("key", key_params(sid, "a"));
  let frame = wait_redraw(&mut client, sid, Duration::from_secs(2), |frame| {
    frame_text(frame).starts_with('a')
  })
  .expect("echoed key never rendered");
  assert_eq!(frame_cursor(&frame), (0, 1), "cursor should sit after the echo");

  client.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn broadcast_sends_identical_frames_to_both_clients() {
  let server = TestServer::start();
  let mut a = Client::connect(&server);
  let mut b = Client::connect(&server);

  let sid = a
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");
  b.call_ok("attach", vec![Value::Uint(sid)]);

  a.call_ok(
    "write",
    vec![Value::Uint(sid), Value::Bin(b"marker".to_vec())],
  );

  let looks_right = |frame: &Value| frame_text(frame).contains("marker");
  let frame_a =
    wait_redraw(&mut a, sid, Duration::from_secs(2), looks_right).expect("client a frame");
  let frame_b =
    wait_redraw(&mut b, sid, Duration::from_secs(2), looks_right).expect("client b frame");
  assert_eq!(frame_a, frame_b, "broadcast frames must be identical");

  a.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn redraw_rate_is_clamped() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");
  // Swallow the attach snapshot.
  let _ = client.next_notification("redraw", Duration::from_millis(300));

  for _ in 0..1000 {
    client.notify("write", vec![Value::Uint(sid), Value::Bin(b"y".to_vec())]);
  }

  let mut times: Vec<Instant> = Vec::new();
  loop {
    match client.next_notification("redraw", Duration::from_millis(400)) {
      Some(_) => times.push(Instant::now()),
      None => break,
    }
  }
  assert!(!times.is_empty(), "no redraws at all");
  let span = *times.last().unwrap() - times[0];
  let allowed = (span.as_millis() / 8) as usize + 4;
  assert!(
    times.len() <= allowed,
    "{} redraws over {span:?} exceeds the 8 ms clamp",
    times.len()
  );

  client.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn dead_client_does_not_disturb_the_session() {
  let server = TestServer::start();
  let mut a = Client::connect(&server);
  let mut b = Client::connect(&server);

  let sid = a
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");
  b.call_ok("attach", vec![Value::Uint(sid)]);

  // Kill client A mid-stream.
  let _ = a.stream.shutdown(std::net::Shutdown::Both);
  drop(a);

  b.call_ok(
    "write",
    vec![Value::Uint(sid), Value::Bin(b"still-alive".to_vec())],
  );
  let frame = wait_redraw(&mut b, sid, Duration::from_secs(2), |frame| {
    frame_text(frame).contains("still-alive")
  });
  assert!(frame.is_some(), "surviving client stopped receiving frames");

  b.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn protocol_violation_closes_only_the_offender() {
  let server = TestServer::start();
  let mut good = Client::connect(&server);
  let mut bad = Client::connect(&server);

  let sid = good
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");

  // Type tag 7 does not exist.
  let garbage = prise::msgpack::encode_to_vec(&Value::Array(vec![
    Value::Uint(7),
    Value::Uint(1),
    Value::Str("x".into()),
    Value::Array(vec![]),
  ]));
  bad.send_raw(&garbage);
  assert!(
    bad.is_closed(Duration::from_secs(2)),
    "offending client must be disconnected"
  );

  // The well-behaved client and the pty are unaffected.
  good.call_ok(
    "write",
    vec![Value::Uint(sid), Value::Bin(b"unaffected".to_vec())],
  );
  let frame = wait_redraw(&mut good, sid, Duration::from_secs(2), |frame| {
    frame_text(frame).contains("unaffected")
  });
  assert!(frame.is_some());

  good.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn unknown_method_is_an_rpc_error_not_a_disconnect() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let (error, result) = client.call("frobnicate", vec![]);
  assert_eq!(error.as_str(), Some("unknown method: frobnicate"));
  assert!(result.is_nil());

  // Still connected and serving.
  let sessions = client.call_ok("list_sessions", vec![]);
  assert_eq!(sessions.as_array().map(<[Value]>::len), Some(0));
}

#[test]
#[serial]
fn bad_spawn_leaves_no_session_behind() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let (error, _) = client.call(
    "spawn",
    vec![Value::Map(vec![(
      "argv".into(),
      Value::Array(vec![Value::Str("/definitely/not/a/binary".into())]),
    )])],
  );
  assert!(!error.is_nil(), "spawn of a bad binary must fail");

  let sessions = client.call_ok("list_sessions", vec![]);
  assert_eq!(sessions.as_array().map(<[Value]>::len), Some(0));
}

#[test]
#[serial]
fn list_sessions_reflects_lifecycle() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/cat"], 100, 30))
    .as_u64()
    .expect("session id");

  let sessions = client.call_ok("list_sessions", vec![]);
  let list = sessions.as_array().expect("array");
  assert_eq!(list.len(), 1);
  assert_eq!(list[0].get("id").and_then(Value::as_u64), Some(sid));
  assert_eq!(list[0].get("cols").and_then(Value::as_u16), Some(100));
  assert_eq!(list[0].get("rows").and_then(Value::as_u16), Some(30));

  client.call_ok("kill", vec![Value::Uint(sid)]);
  client
    .next_notification("pty_exited", Duration::from_secs(2))
    .expect("pty_exited after kill");

  let sessions = client.call_ok("list_sessions", vec![]);
  assert_eq!(sessions.as_array().map(<[Value]>::len), Some(0));
}

#[test]
#[serial]
fn detach_stops_redraws_for_that_client() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");
  let _ = client.next_notification("redraw", Duration::from_millis(300));

  client.call_ok("detach", vec![Value::Uint(sid)]);
  client.call_ok(
    "write",
    vec![Value::Uint(sid), Value::Bin(b"quiet".to_vec())],
  );
  assert!(
    client
      .next_notification("redraw", Duration::from_millis(500))
      .is_none(),
    "detached client must not receive redraws"
  );

  client.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn resize_is_authoritative_and_visible() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let sid = client
    .call_ok("spawn", spawn_params(&["/bin/cat"], 80, 24))
    .as_u64()
    .expect("session id");
  client.call_ok(
    "resize",
    vec![Value::Uint(sid), Value::Uint(132), Value::Uint(43)],
  );

  let frame = wait_redraw(&mut client, sid, Duration::from_secs(2), |frame| {
    frame.get("cols").and_then(Value::as_u16) == Some(132)
  });
  assert!(frame.is_some(), "resize should produce a resized frame");

  let sessions = client.call_ok("list_sessions", vec![]);
  let list = sessions.as_array().expect("array");
  assert_eq!(list[0].get("cols").and_then(Value::as_u16), Some(132));
  assert_eq!(list[0].get("rows").and_then(Value::as_u16), Some(43));

  client.call_ok("kill", vec![Value::Uint(sid)]);
}

#[test]
#[serial]
fn quit_shuts_the_server_down_cleanly() {
  let server = TestServer::start();
  let mut client = Client::connect(&server);

  let result = client.call_ok("quit", vec![]);
  assert!(result.is_nil());

  let socket = server.socket.clone();
  server.join().expect("clean shutdown");
  assert!(!socket.exists(), "socket should be unlinked on shutdown");
}
