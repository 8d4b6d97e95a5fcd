use super::{SocketName, Stream};
use crate::{
    protocol::{self, Annotations, Header, SessionId},
    Error,
};
use std::{io::IoSlice, os::fd::AsRawFd, time::Duration};

/// Client side of the connection, which runs in the process that may (or has)
/// crashed to communicate with an external supervisor process.
pub struct Client {
    socket: Stream,
}

impl Client {
    /// Creates a new client connected to the supervisor at the given name.
    ///
    /// # Errors
    ///
    /// The specified socket name is invalid, or a connection cannot be made
    /// with a server. Callers are expected to treat a failure here as
    /// "proceed without crash reporting" rather than a fatal condition.
    pub fn with_name<'scope>(name: impl Into<SocketName<'scope>>) -> Result<Self, Error> {
        let addr = name.into().to_addr()?;

        Ok(Self {
            socket: Stream::connect_unix_addr(&addr)?,
        })
    }

    /// Registers this process with the supervisor, supplying the initial
    /// annotation set that will be attached to any report produced for it.
    ///
    /// Returns the session id the supervisor assigned. Blocks until the
    /// supervisor acknowledges, up to `timeout`.
    pub fn register(&self, annotations: &Annotations, timeout: Duration) -> Result<u32, Error> {
        let payload = protocol::encode_annotations(annotations)?;
        self.send(protocol::REGISTER, &payload)?;

        let mut buf = [0u8; 64];
        let (header, len) = self.recv_control(timeout, &mut buf)?;

        if header.kind != protocol::REGISTER_ACK {
            return Err(Error::MalformedMessage(header.kind));
        }

        use scroll::Pread;
        let sid: SessionId = buf[std::mem::size_of::<Header>()..len].pread_with(0, scroll::LE)?;
        Ok(sid.id)
    }

    /// Sends an annotation delta, merged over the annotations supplied at
    /// registration. May be called at any time before a crash.
    ///
    /// There is no acknowledgment; the transport is reliable and keeping
    /// receives reserved for the crash path keeps that path simple.
    pub fn set_annotations(&self, delta: &Annotations) -> Result<(), Error> {
        let payload = protocol::encode_annotations(delta)?;
        self.send(protocol::SET_ANNOTATIONS, &payload)
    }

    /// Sends a keep-alive to the supervisor and waits for the response.
    ///
    /// Useful when the server is run with a stale connection timeout and the
    /// client has no other reason to send messages.
    pub fn ping(&self, timeout: Duration) -> Result<(), Error> {
        self.send(protocol::PING, &[])?;

        let mut buf = [0u8; std::mem::size_of::<Header>()];
        let (header, _len) = self.recv_control(timeout, &mut buf)?;

        if header.kind != protocol::PONG {
            return Err(Error::MalformedMessage(header.kind));
        }

        Ok(())
    }

    /// Notifies the supervisor that this process has crashed and blocks until
    /// it has finished capturing state, up to `timeout`.
    ///
    /// This is the one method on this type that is legal to call from a
    /// compromised context: it performs no allocation and takes no locks. The
    /// event is passed by reference as it is larger than one would want on an
    /// alternate stack; keeping it in static storage is recommended.
    ///
    /// A timeout is not a failure of this process: the supervisor may be
    /// stuck or gone, and the caller should proceed with termination either
    /// way. The bounded wait only exists so an unresponsive supervisor cannot
    /// hang a crashing process forever.
    pub fn notify_crash(
        &self,
        event: &fault_context::CrashEvent,
        timeout: Duration,
    ) -> Result<(), Error> {
        let event_buf = event.as_bytes();

        let header = Header::new(protocol::CRASH, event_buf.len() as u32);

        let io_bufs = [IoSlice::new(header.as_bytes()), IoSlice::new(event_buf)];
        self.socket.send_vectored(&io_bufs)?;

        let mut ack = [0u8; std::mem::size_of::<Header>()];
        let (header, _len) = self.recv_control(timeout, &mut ack)?;

        if header.kind != protocol::CRASH_ACK {
            return Err(Error::MalformedMessage(header.kind));
        }

        Ok(())
    }

    fn send(&self, kind: u16, payload: &[u8]) -> Result<(), Error> {
        let header = Header::new(kind, payload.len() as u32);

        let io_bufs = [IoSlice::new(header.as_bytes()), IoSlice::new(payload)];
        self.socket.send_vectored(&io_bufs)?;

        Ok(())
    }

    /// Receives one control packet into `buf`, enforcing the bounded wait and
    /// the protocol version.
    fn recv_control(&self, timeout: Duration, buf: &mut [u8]) -> Result<(Header, usize), Error> {
        self.wait_readable(timeout)?;

        let len = self.socket.recv(buf)?;
        if len < std::mem::size_of::<Header>() {
            return Err(Error::MalformedMessage(0));
        }

        let header = Header::from_bytes(&buf[..std::mem::size_of::<Header>()])
            .ok_or(Error::MalformedMessage(0))?;
        header.validate()?;

        Ok((header, len))
    }

    /// Waits for the socket to become readable via `poll(2)`, which is async
    /// signal safe, unlike anything allocating a reactor.
    fn wait_readable(&self, timeout: Duration) -> Result<(), Error> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        loop {
            #[allow(unsafe_code)]
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

            if ret > 0 {
                return Ok(());
            } else if ret == 0 {
                return Err(Error::AckTimeout);
            }

            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}
