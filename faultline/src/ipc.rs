//! The Transport: a seqpacket channel between a monitored process and the
//! supervising handler process, built so the handler side keeps working when
//! a client terminates abnormally mid-conversation.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

mod client;
mod server;

pub use client::Client;
pub use server::{CaptureOutput, Server, ServerDelegate};

/// A socket name.
///
/// A file path works everywhere; additionally, Linux can use a plain string
/// that will be used as an abstract name, which needs no filesystem cleanup.
/// See [here](https://man7.org/linux/man-pages/man7/unix.7.html) for more
/// details on abstract namespace sockets.
pub enum SocketName<'scope> {
    Path(&'scope std::path::Path),
    Abstract(&'scope str),
}

impl<'scope> From<&'scope std::path::Path> for SocketName<'scope> {
    fn from(s: &'scope std::path::Path) -> Self {
        Self::Path(s)
    }
}

impl<'scope> From<&'scope str> for SocketName<'scope> {
    fn from(s: &'scope str) -> Self {
        Self::Abstract(s)
    }
}

impl<'scope> From<&'scope String> for SocketName<'scope> {
    fn from(s: &'scope String) -> Self {
        Self::from(s.as_str())
    }
}

impl SocketName<'_> {
    pub(crate) fn to_addr(&self) -> Result<uds::UnixSocketAddr, crate::Error> {
        match self {
            Self::Path(path) => {
                uds::UnixSocketAddr::from_path(path).map_err(|_err| crate::Error::InvalidName)
            }
            Self::Abstract(name) => {
                uds::UnixSocketAddr::from_abstract(name).map_err(|_err| crate::Error::InvalidName)
            }
        }
    }
}

/// The blocking socket used by the client side
pub(crate) type Stream = uds::UnixSeqpacketConn;

/// Newtypes so the listener and accepted connections can be registered with
/// [`polling`], which wants io-safety traits the raw socket types don't
/// provide themselves.
pub(crate) struct Listener(pub(crate) uds::nonblocking::UnixSeqpacketListener);

pub(crate) struct Connection(pub(crate) uds::nonblocking::UnixSeqpacketConn);

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd is owned by the wrapped listener which lives as long
        // as the returned borrow
        #[allow(unsafe_code)]
        unsafe {
            BorrowedFd::borrow_raw(self.0.as_raw_fd())
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: as above, the borrow cannot outlive the wrapped connection
        #[allow(unsafe_code)]
        unsafe {
            BorrowedFd::borrow_raw(self.0.as_raw_fd())
        }
    }
}
