use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::bus::common::{Error, Result};

/// The peer identity obtained from the kernel for a connected unix-domain
/// socket. Used by the EXTERNAL auth mechanism (§4.4) to authenticate a peer
/// without it ever sending its identity over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Reads the peer's credentials from `fd` via `SO_PEERCRED`, same mechanism
/// `dbus-transport-unix.c`'s `_dbus_read_credentials_socket` uses on Linux.
#[cfg(target_os = "linux")]
pub fn read_peer_credentials(fd: RawFd) -> Result<PeerCredentials> {
    let mut creds: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut creds as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rv != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok(PeerCredentials {
        uid: creds.uid,
        gid: creds.gid,
        pid: creds.pid as u32,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_peer_credentials(_fd: RawFd) -> Result<PeerCredentials> {
    Err(Error::new("peer credential lookup is not implemented on this platform"))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn read_peer_credentials_on_loopback_unix_socket() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = read_peer_credentials(a.as_raw_fd()).unwrap();
        assert_eq!(creds.uid, unsafe { libc::getuid() });
    }
}
