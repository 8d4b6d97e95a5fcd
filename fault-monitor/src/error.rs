use std::fmt;

/// An error that can occur when attaching or detaching a [`crate::FaultMonitor`]
#[derive(Debug)]
pub enum Error {
    /// Unable to `mmap` memory for the alternate signal stack
    OutOfMemory,
    /// For simplicity sake, only one [`crate::FaultMonitor`] can be attached
    /// at any one time
    MonitorAlreadyAttached,
    /// An I/O or other syscall failed
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("unable to allocate memory"),
            Self::MonitorAlreadyAttached => f.write_str("a fault monitor is already attached"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
