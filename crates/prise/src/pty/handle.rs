//! PTY open/spawn plumbing over portable-pty.
//!
//! The handle owns the master side and the child. Reads happen on a cloned
//! reader owned by the session's worker thread; server-side writes go
//! through the reactor against the raw master fd. The two coexist on the
//! same pty as long as the fd outlives both, which the session teardown
//! order guarantees.

use std::io::{Read, Write};
use std::os::unix::io::RawFd;

use anyhow::Context;
use portable_pty::{CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};

use crate::msgpack::{DecodeError, Value, fields_from_value};

/// Wire shape of `spawn` options:
/// `{ argv: [string], cwd: string?, env: [string]?, cols: u16, rows: u16 }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
  pub argv: Vec<String>,
  pub cwd: Option<String>,
  /// `KEY=VALUE` entries.
  pub env: Vec<String>,
  pub cols: u16,
  pub rows: u16,
}

impl SpawnOptions {
  #[must_use]
  pub fn shell(argv: Vec<String>, cols: u16, rows: u16) -> Self {
    Self {
      argv,
      cwd: None,
      env: Vec::new(),
      cols,
      rows,
    }
  }

  /// Decodes spawn options. `argv` may be absent on the wire; the server
  /// substitutes its configured default shell before opening the pty.
  pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
    let slots = fields_from_value(value, &["argv", "cwd", "env", "cols", "rows"])?;
    let argv = match &slots[0] {
      Some(Value::Array(items)) => items
        .iter()
        .map(|v| {
          v.as_str()
            .map(str::to_owned)
            .ok_or(DecodeError::InvalidFormat("argv entries must be strings"))
        })
        .collect::<Result<Vec<_>, _>>()?,
      Some(Value::Nil) | None => Vec::new(),
      Some(_) => return Err(DecodeError::InvalidFormat("argv must be an array")),
    };
    let cwd = match &slots[1] {
      Some(Value::Str(s)) => Some(s.clone()),
      Some(Value::Nil) | None => None,
      Some(_) => return Err(DecodeError::InvalidFormat("cwd must be a string")),
    };
    let env = match &slots[2] {
      Some(Value::Array(items)) => items
        .iter()
        .map(|v| {
          v.as_str()
            .map(str::to_owned)
            .ok_or(DecodeError::InvalidFormat("env entries must be strings"))
        })
        .collect::<Result<Vec<_>, _>>()?,
      Some(Value::Nil) | None => Vec::new(),
      Some(_) => return Err(DecodeError::InvalidFormat("env must be an array")),
    };
    let cols = slots[3]
      .as_ref()
      .and_then(Value::as_u16)
      .ok_or(DecodeError::InvalidFormat("spawn requires cols"))?;
    let rows = slots[4]
      .as_ref()
      .and_then(Value::as_u16)
      .ok_or(DecodeError::InvalidFormat("spawn requires rows"))?;
    Ok(Self {
      argv,
      cwd,
      env,
      cols,
      rows,
    })
  }

  #[must_use]
  pub fn to_value(&self) -> Value {
    let mut pairs = vec![(
      Value::from("argv"),
      Value::Array(self.argv.iter().map(|a| Value::Str(a.clone())).collect()),
    )];
    if let Some(cwd) = &self.cwd {
      pairs.push(("cwd".into(), Value::Str(cwd.clone())));
    }
    if !self.env.is_empty() {
      pairs.push((
        "env".into(),
        Value::Array(self.env.iter().map(|e| Value::Str(e.clone())).collect()),
      ));
    }
    pairs.push(("cols".into(), self.cols.into()));
    pairs.push(("rows".into(), self.rows.into()));
    Value::Map(pairs)
  }

  fn command_builder(&self) -> CommandBuilder {
    let mut builder = CommandBuilder::new(&self.argv[0]);
    for arg in &self.argv[1..] {
      builder.arg(arg);
    }
    if let Some(cwd) = &self.cwd {
      builder.cwd(cwd);
    }
    for entry in &self.env {
      if let Some((k, v)) = entry.split_once('=') {
        builder.env(k, v);
      }
    }
    builder
  }
}

/// Resolves `program` to an executable path the way exec would. Spawning
/// forks before exec, so without this check a bad argv[0] would surface as
/// an instantly-exiting child instead of an error to the caller.
#[must_use]
pub fn resolve_program(program: &str) -> Option<std::path::PathBuf> {
  use std::os::unix::fs::PermissionsExt;
  let executable = |path: &std::path::Path| {
    path
      .metadata()
      .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
  };
  if program.contains('/') {
    let path = std::path::PathBuf::from(program);
    return executable(&path).then_some(path);
  }
  let search = std::env::var_os("PATH")?;
  std::env::split_paths(&search)
    .map(|dir| dir.join(program))
    .find(|candidate| executable(candidate))
}

pub struct PtyHandle {
  master: Box<dyn MasterPty + Send>,
  child: Box<dyn portable_pty::Child + Send>,
  /// Writer handed to the reader worker for parser reply streams.
  reply_writer: Option<Box<dyn Write + Send>>,
  fd: RawFd,
}

impl PtyHandle {
  /// Opens the pty pair and spawns the child. Nothing is left behind on
  /// failure; the pair closes with the error path.
  pub fn open(options: &SpawnOptions) -> anyhow::Result<Self> {
    let pty_size = PtySize {
      rows: options.rows,
      cols: options.cols,
      pixel_width: 0,
      pixel_height: 0,
    };
    let pty_system = native_pty_system();
    let pair = pty_system
      .openpty(pty_size)
      .context("open pty pair")?;
    let child = pair
      .slave
      .spawn_command(options.command_builder())
      .with_context(|| format!("spawn {:?}", options.argv))?;
    drop(pair.slave);

    let master = pair.master;
    let reply_writer = master.take_writer().context("take pty writer")?;
    let fd = master
      .as_raw_fd()
      .context("pty master exposes no raw fd")?;
    Ok(Self {
      master,
      child,
      reply_writer: Some(reply_writer),
      fd,
    })
  }

  /// Raw master fd for reactor write submissions.
  #[must_use]
  pub fn fd(&self) -> RawFd {
    self.fd
  }

  /// Cloned blocking reader for the worker thread.
  pub fn clone_reader(&self) -> anyhow::Result<Box<dyn Read + Send>> {
    self.master.try_clone_reader().context("clone pty reader")
  }

  /// The write half for parser replies; taken once by the worker.
  pub fn take_reply_writer(&mut self) -> anyhow::Result<Box<dyn Write + Send>> {
    self
      .reply_writer
      .take()
      .context("pty reply writer already taken")
  }

  pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
    self
      .master
      .resize(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
      })
      .context("resize pty")
  }

  pub fn try_wait(&mut self) -> Option<ExitStatus> {
    match self.child.try_wait() {
      Ok(status) => status,
      Err(_) => None,
    }
  }

  pub fn kill(&mut self) {
    let _ = self.child.kill();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn options_decode_from_map() {
    let wire = Value::Map(vec![
      (
        "argv".into(),
        Value::Array(vec![Value::Str("/bin/echo".into()), Value::Str("hi".into())]),
      ),
      ("cols".into(), Value::Uint(80)),
      ("rows".into(), Value::Uint(24)),
    ]);
    let options = SpawnOptions::from_value(&wire).unwrap();
    assert_eq!(options.argv, vec!["/bin/echo", "hi"]);
    assert_eq!(options.cwd, None);
    assert!(options.env.is_empty());
    assert_eq!((options.cols, options.rows), (80, 24));
  }

  #[test]
  fn options_decode_from_positional_array() {
    let wire = Value::Array(vec![
      Value::Array(vec![Value::Str("sh".into())]),
      Value::Str("/tmp".into()),
      Value::Array(vec![Value::Str("TERM=dumb".into())]),
      Value::Uint(120),
      Value::Uint(40),
    ]);
    let options = SpawnOptions::from_value(&wire).unwrap();
    assert_eq!(options.argv, vec!["sh"]);
    assert_eq!(options.cwd.as_deref(), Some("/tmp"));
    assert_eq!(options.env, vec!["TERM=dumb"]);
    assert_eq!((options.cols, options.rows), (120, 40));
  }

  #[test]
  fn missing_size_is_rejected() {
    let wire = Value::Map(vec![(
      "argv".into(),
      Value::Array(vec![Value::Str("sh".into())]),
    )]);
    assert!(SpawnOptions::from_value(&wire).is_err());
  }

  #[test]
  fn absent_argv_defers_to_the_server_default() {
    let wire = Value::Map(vec![
      ("cols".into(), Value::Uint(80)),
      ("rows".into(), Value::Uint(24)),
    ]);
    let options = SpawnOptions::from_value(&wire).unwrap();
    assert!(options.argv.is_empty());
  }

  #[test]
  fn roundtrips_through_wire_form() {
    let options = SpawnOptions {
      argv: vec!["/bin/sh".into(), "-c".into(), "true".into()],
      cwd: Some("/tmp".into()),
      env: vec!["A=1".into()],
      cols: 80,
      rows: 24,
    };
    let back = SpawnOptions::from_value(&options.to_value()).unwrap();
    assert_eq!(back, options);
  }

  #[test]
  fn resolve_program_finds_sh_and_rejects_nonsense() {
    assert!(resolve_program("sh").is_some());
    assert!(resolve_program("/bin/sh").is_some());
    assert!(resolve_program("/definitely/not/a/binary").is_none());
    assert!(resolve_program("definitely-not-a-binary-on-path").is_none());
  }
}
