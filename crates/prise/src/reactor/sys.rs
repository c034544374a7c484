//! Raw fd syscalls shared by the readiness and completion backends.
//!
//! Every function maps `EINTR` to an internal retry and `EAGAIN` to
//! `Ok(None)` so the backends never surface transient errors.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::reactor::ErrorKind;

/// Read size for one reactor read op.
pub const READ_CHUNK: usize = 64 * 1024;

pub fn map_err(err: &io::Error) -> ErrorKind {
  match err.raw_os_error() {
    Some(libc::ECONNRESET) => ErrorKind::ConnectionReset,
    Some(libc::EPIPE) => ErrorKind::BrokenPipe,
    Some(code) => ErrorKind::Os(code),
    None => ErrorKind::Os(0),
  }
}

fn is_transient(err: &io::Error) -> bool {
  matches!(err.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK))
}

/// Creates a non-blocking, close-on-exec Unix stream socket.
#[cfg(target_os = "linux")]
pub fn socket() -> io::Result<RawFd> {
  let fd = unsafe {
    libc::socket(
      libc::AF_UNIX,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
    )
  };
  if fd < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(fd)
}

/// Creates a non-blocking, close-on-exec Unix stream socket.
#[cfg(not(target_os = "linux"))]
pub fn socket() -> io::Result<RawFd> {
  let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
  if fd < 0 {
    return Err(io::Error::last_os_error());
  }
  set_nonblocking_cloexec(fd)?;
  Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
  unsafe {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
      let err = io::Error::last_os_error();
      close(fd);
      return Err(err);
    }
    if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
      let err = io::Error::last_os_error();
      close(fd);
      return Err(err);
    }
  }
  Ok(())
}

pub fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
  let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
  addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
  let bytes = path.as_os_str().as_bytes();
  if bytes.len() >= addr.sun_path.len() {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      "socket path too long",
    ));
  }
  for (i, b) in bytes.iter().enumerate() {
    addr.sun_path[i] = *b as libc::c_char;
  }
  let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
  Ok((addr, len as libc::socklen_t))
}

pub enum ConnectStart {
  Done(RawFd),
  InProgress(RawFd),
}

/// Starts a non-blocking connect; the caller watches for writability and
/// then checks [`so_error`].
pub fn connect_start(path: &Path) -> io::Result<ConnectStart> {
  let fd = socket()?;
  let (addr, len) = match sockaddr_un(path) {
    Ok(pair) => pair,
    Err(err) => {
      close(fd);
      return Err(err);
    }
  };
  let rc = unsafe { libc::connect(fd, std::ptr::from_ref(&addr).cast(), len) };
  if rc == 0 {
    return Ok(ConnectStart::Done(fd));
  }
  let err = io::Error::last_os_error();
  match err.raw_os_error() {
    Some(libc::EINPROGRESS | libc::EAGAIN) => Ok(ConnectStart::InProgress(fd)),
    _ => {
      close(fd);
      Err(err)
    }
  }
}

/// Pending socket error after writable readiness; 0 means connected.
pub fn so_error(fd: RawFd) -> i32 {
  let mut err: libc::c_int = 0;
  let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
  let rc = unsafe {
    libc::getsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      std::ptr::from_mut(&mut err).cast(),
      &mut len,
    )
  };
  if rc != 0 {
    return io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
  }
  err
}

/// One read of up to [`READ_CHUNK`] bytes. `Ok(None)` means would-block.
pub fn read(fd: RawFd) -> io::Result<Option<Vec<u8>>> {
  let mut buf = vec![0u8; READ_CHUNK];
  loop {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n >= 0 {
      buf.truncate(n as usize);
      return Ok(Some(buf));
    }
    let err = io::Error::last_os_error();
    if is_transient(&err) {
      return Ok(None);
    }
    if err.raw_os_error() != Some(libc::EINTR) {
      return Err(err);
    }
  }
}

/// One write. `Ok(None)` means would-block; short writes are the caller's
/// problem.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
  loop {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n >= 0 {
      return Ok(Some(n as usize));
    }
    let err = io::Error::last_os_error();
    if is_transient(&err) {
      return Ok(None);
    }
    if err.raw_os_error() != Some(libc::EINTR) {
      return Err(err);
    }
  }
}

/// One accept. `Ok(None)` means would-block.
pub fn accept(fd: RawFd) -> io::Result<Option<RawFd>> {
  loop {
    #[cfg(target_os = "linux")]
    let n = unsafe {
      libc::accept4(
        fd,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      )
    };
    #[cfg(not(target_os = "linux"))]
    let n = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if n >= 0 {
      #[cfg(not(target_os = "linux"))]
      set_nonblocking_cloexec(n)?;
      return Ok(Some(n));
    }
    let err = io::Error::last_os_error();
    if is_transient(&err) {
      return Ok(None);
    }
    if err.raw_os_error() != Some(libc::EINTR) {
      return Err(err);
    }
  }
}

pub fn close(fd: RawFd) {
  unsafe {
    libc::close(fd);
  }
}
