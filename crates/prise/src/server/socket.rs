//! Listener socket setup and path resolution.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};

/// Default socket path: `$XDG_RUNTIME_DIR/prise.sock` when the runtime dir
/// is set, `/tmp/prise-<uid>.sock` otherwise.
#[must_use]
pub fn default_socket_path() -> PathBuf {
  if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR")
    && !dir.is_empty()
  {
    return PathBuf::from(dir).join("prise.sock");
  }
  let uid = unsafe { libc::getuid() };
  PathBuf::from(format!("/tmp/prise-{uid}.sock"))
}

/// Binds the listener, probing and unlinking a stale socket first. A live
/// socket at the path means another server owns it and startup fails.
pub fn bind_listener(path: &Path) -> anyhow::Result<UnixListener> {
  if let Some(dir) = path.parent()
    && !dir.as_os_str().is_empty()
    && !dir.exists()
  {
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    debug!("created socket directory {}", dir.display());
  }

  if path.exists() {
    match UnixStream::connect(path) {
      Ok(_) => {
        warn!("live socket at {}; server already running", path.display());
        anyhow::bail!("server already running at {}", path.display())
      }
      Err(err) if err.kind() == ErrorKind::ConnectionRefused || err.kind() == ErrorKind::NotFound => {
        info!("removing stale socket {}", path.display());
        let _ = fs::remove_file(path);
      }
      Err(err) => {
        info!(
          "socket probe failed ({err}); removing stale socket {}",
          path.display()
        );
        let _ = fs::remove_file(path);
      }
    }
  }

  let listener = UnixListener::bind(path)
    .with_context(|| format!("bind unix listener at {}", path.display()))?;
  listener.set_nonblocking(true)?;
  info!("listening at {}", path.display());
  Ok(listener)
}
