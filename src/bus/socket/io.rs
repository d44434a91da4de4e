use std::io::{self, IoSlice};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use tokio::net::{TcpStream, UnixStream};

use crate::bus::common::{Error, Result};
use crate::bus::socket::unix_creds::{read_peer_credentials, PeerCredentials};

/// A full-duplex byte stream, either a TCP or a unix-domain socket (§2 C2).
///
/// Mirrors the teacher crate's `TransportStream`: a thin enum over the two
/// `tokio::net` stream types, exposing the common non-blocking
/// try_read/try_write/readable/writable surface the transport's I/O loop
/// needs, without committing to either transport kind at compile time.
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Socket::Tcp(stream))
    }

    pub async fn connect_unix<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Socket::Unix(stream))
    }

    /// Connects to a unix-domain socket in the abstract namespace (a name
    /// with no backing path on the filesystem, Linux-only): the socket's
    /// `sun_path` starts with a NUL byte followed by `name`. `tokio::net`
    /// has no abstract-namespace constructor, so this goes through `libc`
    /// directly, the same way `_dbus_connect_unix_socket` builds the
    /// `sockaddr_un` by hand for the abstract case.
    #[cfg(target_os = "linux")]
    pub async fn connect_unix_abstract(name: &str) -> Result<Self> {
        let std_stream = connect_unix_abstract_blocking(name)?;
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        Ok(Socket::Unix(stream))
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn connect_unix_abstract(_name: &str) -> Result<Self> {
        Err(Error::new("abstract-namespace unix sockets are only supported on linux"))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Socket::Unix(..))
    }

    /// Resolves once the socket is readable. Completes immediately if data
    /// (or EOF, or an error) is already pending.
    pub async fn readable(&self) -> Result<()> {
        match self {
            Socket::Tcp(s) => s.readable().await.map_err(Error::from),
            Socket::Unix(s) => s.readable().await.map_err(Error::from),
        }
    }

    pub async fn writable(&self) -> Result<()> {
        match self {
            Socket::Tcp(s) => s.writable().await.map_err(Error::from),
            Socket::Unix(s) => s.writable().await.map_err(Error::from),
        }
    }

    /// Non-blocking read. `Ok(0)` means the peer closed the connection;
    /// `Err` with `io::ErrorKind::WouldBlock` is surfaced so callers can
    /// distinguish "come back later" from a fatal error (§4.2).
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_read(buf).map_err(Error::from),
            Socket::Unix(s) => s.try_read(buf).map_err(Error::from),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_write(buf).map_err(Error::from),
            Socket::Unix(s) => s.try_write(buf).map_err(Error::from),
        }
    }

    /// Writes from two buffers as a single vectored syscall, the way
    /// `dbus-transport-unix.c`'s `_dbus_write_two` sends a message's header
    /// and body without concatenating them first. Falls back to writing
    /// only `a` if the kernel accepts fewer bytes than `a.len()`.
    pub fn try_write_two(&self, a: &[u8], b: &[u8]) -> Result<usize> {
        let bufs = [IoSlice::new(a), IoSlice::new(b)];
        let result = match self {
            Socket::Tcp(s) => s.try_io(tokio::io::Interest::WRITABLE, || {
                io_slices_write(s.as_raw_fd(), &bufs)
            }),
            Socket::Unix(s) => s.try_io(tokio::io::Interest::WRITABLE, || {
                io_slices_write(s.as_raw_fd(), &bufs)
            }),
        };
        result.map_err(Error::from)
    }

    /// Credentials of the connecting peer, available only for unix-domain
    /// sockets. Used by the EXTERNAL auth mechanism (§4.4).
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        match self {
            Socket::Unix(s) => read_peer_credentials(s.as_raw_fd()),
            Socket::Tcp(_) => Err(Error::new("peer credentials are only available on unix sockets")),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Builds the `sockaddr_un` for an abstract-namespace address and connects
/// to it. Non-blocking connects to a unix socket either complete
/// synchronously or return `EINPROGRESS`; either way the returned fd is
/// ready to hand to tokio, which will observe the rest of the handshake
/// through ordinary readiness.
#[cfg(target_os = "linux")]
fn connect_unix_abstract_blocking(name: &str) -> Result<std::os::unix::net::UnixStream> {
    if name.len() >= 107 {
        return Err(Error::new("abstract socket name too long"));
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0) };
    if fd < 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // sun_path[0] == 0 marks the abstract namespace; the name follows
    // starting at sun_path[1], not NUL-terminated.
    let name_bytes = name.as_bytes();
    let path_bytes: &mut [u8] = unsafe {
        std::slice::from_raw_parts_mut(addr.sun_path.as_mut_ptr() as *mut u8, addr.sun_path.len())
    };
    path_bytes[1..1 + name_bytes.len()].copy_from_slice(name_bytes);
    let addr_len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len()) as libc::socklen_t;

    let rv = unsafe {
        libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        )
    };
    if rv < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(Error::from(err));
        }
    }

    Ok(unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) })
}

fn io_slices_write(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let rv = unsafe { libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rv as usize)
}
