use super::{Connection, Listener, SocketName};
use crate::{
    dump,
    protocol::{self, Annotations, Header, SessionId},
    snapshot::ProcessSnapshot,
    store::{CrashReport, ReportStore},
    Error, LoopAction,
};
use polling::{Event, Events, Poller};
use std::{
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// How long in-flight captures are given to finish once the run loop has
/// been asked to shut down
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Allows user code to observe the server without hardcoding too many details
pub trait ServerDelegate: Send + Sync {
    /// Called whenever a client connects.
    ///
    /// A return value of [`LoopAction::Exit`] stops the message loop.
    fn on_client_connected(&self, _num_clients: usize) -> LoopAction {
        LoopAction::Continue
    }

    /// Called whenever a client disconnects, including when its connection is
    /// handed off to a capture worker.
    fn on_client_disconnected(&self, _num_clients: usize) -> LoopAction {
        LoopAction::Continue
    }

    /// Called on a capture worker thread once a crash capture has finished,
    /// successfully or not. Failures here concern only the one client; the
    /// server keeps serving everyone else either way.
    fn on_capture(&self, result: Result<CaptureOutput, Error>);
}

/// The product of one successful crash capture
pub struct CaptureOutput {
    /// The durable record registered in the report store, in `Pending` state
    pub report: CrashReport,
    /// Whether parts of the faulting process could not be read and the
    /// artifact is partial
    pub degraded: bool,
}

struct ClientConn {
    /// The actual socket connection we established with accept
    socket: Connection,
    /// The key we associated with the socket
    key: usize,
    /// Last time a message was sent from the client
    last_update: Instant,
    /// The process id reported by the socket's peer credentials
    pid: Option<u32>,
    /// Assigned on registration; a crash notification from an unregistered
    /// connection is a protocol violation
    session: Option<u32>,
    /// The annotations attached to any report produced for this client
    annotations: Annotations,
}

impl ClientConn {
    fn new(socket: Connection, key: usize) -> Self {
        Self {
            socket,
            key,
            last_update: Instant::now(),
            pid: None,
            session: None,
            annotations: Annotations::new(),
        }
    }

    fn recv(&mut self) -> Result<Option<(Header, Vec<u8>)>, Error> {
        use std::io::IoSliceMut;

        let mut hdr_buf = [0u8; std::mem::size_of::<Header>()];
        let len = match self.socket.0.peek(&mut hdr_buf) {
            Ok(len) => len,
            Err(_err) => return Ok(None),
        };

        if len == 0 {
            return Ok(None);
        }

        let header = Header::from_bytes(&hdr_buf).ok_or(Error::MalformedMessage(0))?;
        header.validate()?;

        if header.size == 0 {
            if self.socket.0.recv(&mut hdr_buf).is_err() {
                return Ok(None);
            }
            Ok(Some((header, Vec::new())))
        } else {
            let mut buffer = vec![0; header.size as usize];

            if self
                .socket
                .0
                .recv_vectored(&mut [
                    IoSliceMut::new(&mut hdr_buf),
                    IoSliceMut::new(&mut buffer),
                ])
                .is_err()
            {
                return Ok(None);
            }

            Ok(Some((header, buffer)))
        }
    }
}

/// Server side of the connection, which runs in the supervisor process that
/// monitors the processes where [`super::Client`]s reside.
///
/// Owns the report store for its lifetime: every completed capture lands in
/// it as a `Pending` record.
pub struct Server {
    listener: Option<Listener>,
    /// For abstract sockets, we don't have to worry about cleanup as it is
    /// handled by the OS, but path sockets need to be removed manually. We
    /// rely on the supervisor process exiting cleanly, which should be mostly
    /// true.
    socket_path: Option<std::path::PathBuf>,
    store: Arc<ReportStore>,
    /// Annotations applied to every report regardless of client, merged
    /// underneath the per-client set
    base_annotations: Annotations,
}

impl Server {
    /// Creates a new server with the given name.
    ///
    /// Note that in the case of a path socket name, this method always
    /// attempts to delete the specified path if it exists, as stale socket
    /// files from an aborted supervisor would otherwise prevent binding.
    ///
    /// # Errors
    ///
    /// The provided socket name is invalid, or the listener socket was unable
    /// to be bound to the specified socket name.
    pub fn with_name<'scope>(
        name: impl Into<SocketName<'scope>>,
        store: Arc<ReportStore>,
        base_annotations: Annotations,
    ) -> Result<Self, Error> {
        let sn = name.into();

        let socket_path = if let SocketName::Path(path) = &sn {
            let _res = std::fs::remove_file(path);
            Some(std::path::PathBuf::from(path))
        } else {
            None
        };

        let addr = sn.to_addr()?;
        let listener = Listener(uds::nonblocking::UnixSeqpacketListener::bind_unix_addr(
            &addr,
        )?);

        Ok(Self {
            listener: Some(listener),
            socket_path,
            store,
            base_annotations,
        })
    }

    /// Runs the server loop, accepting client connections, serving the
    /// handshake protocol, and dispatching crash captures.
    ///
    /// Each crash capture runs on its own worker thread so that one stuck or
    /// slow capture never blocks registration of new clients; at most one
    /// capture per client can be in flight since the client's connection is
    /// taken out of the poll set for the duration.
    ///
    /// If `stale_timeout` is specified, client connections that have not sent
    /// a message within that period will be shutdown and removed, to prevent
    /// the supervisor from indefinitely outlasting the process(es) it was
    /// monitoring in cases where the OS takes its time reaping connections
    /// after abrupt process termination. [`super::Client::ping`] can be used
    /// to fill message gaps.
    ///
    /// Shutdown is cooperative: once `shutdown` is set the loop exits, and
    /// in-flight captures are given a bounded grace period to complete.
    ///
    /// # Errors
    ///
    /// This method uses basic I/O event notification via [`polling`] which
    /// can fail for a number of different reasons
    #[allow(unsafe_code)]
    pub fn run(
        &mut self,
        delegate: Arc<dyn ServerDelegate>,
        shutdown: &AtomicBool,
        stale_timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let mut events = Events::new();
        let listener = self.listener.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "the server loop has already been run",
            ))
        })?;

        struct Poll {
            listener: Listener,
            clients: Vec<ClientConn>,
            poll: Poller,
        }

        impl Poll {
            fn new(listener: Listener) -> std::io::Result<Self> {
                let s = Self {
                    listener,
                    poll: Poller::new()?,
                    clients: Vec::new(),
                };

                // SAFETY: We ensure we delete the listener during drop
                unsafe {
                    s.poll.add(&s.listener, Event::readable(0))?;
                }

                Ok(s)
            }

            #[inline]
            fn add(&mut self, src: &Connection, interest: Event) -> std::io::Result<()> {
                // SAFETY: We ensure we delete all sources we add before
                // dropping the poll
                unsafe { self.poll.add(src, interest) }
            }
        }

        impl Drop for Poll {
            fn drop(&mut self) {
                for client in std::mem::take(&mut self.clients) {
                    if let Err(err) = self.poll.delete(&client.socket) {
                        log::error!("failed to deregister socket: {err}");
                    }
                }

                if let Err(err) = self.poll.delete(&self.listener) {
                    log::error!("failed to deregister listener: {err}");
                }
            }
        }

        let mut polling = Poll::new(listener)?;
        let mut id = 1;
        let mut next_session = 1u32;
        let mut captures: Vec<std::thread::JoinHandle<()>> = Vec::new();

        let result = 'run: loop {
            if shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }

            // Reap capture workers that have already finished
            captures.retain(|jh| !jh.is_finished());

            events.clear();
            let timeout = Duration::from_millis(10);
            let deadline = Instant::now() + timeout;
            let mut remaining = Some(timeout);
            while let Some(timeout) = remaining {
                match polling.poll.wait(&mut events, Some(timeout)) {
                    Ok(_) => {
                        break;
                    }
                    Err(e) => {
                        if matches!(e.kind(), ErrorKind::Interrupted) {
                            remaining = deadline.checked_duration_since(Instant::now());
                        } else {
                            break 'run Err(e.into());
                        }
                    }
                }
            }

            for event in events.iter() {
                if event.key == 0 {
                    match polling.listener.0.accept_unix_addr() {
                        Ok((accepted, _addr)) => {
                            let key = id;
                            id += 1;

                            let socket = Connection(accepted);
                            if let Err(err) = polling.add(&socket, Event::readable(key)) {
                                break 'run Err(err.into());
                            }

                            log::debug!("accepted connection {key}");
                            polling.clients.push(ClientConn::new(socket, key));

                            if delegate.on_client_connected(polling.clients.len())
                                == LoopAction::Exit
                            {
                                log::debug!("on_client_connected exited message loop");
                                break 'run Ok(());
                            }
                        }
                        Err(err) => {
                            log::error!("failed to accept socket connection: {err}");
                        }
                    }

                    // We need to reregister interest every time
                    if let Err(err) = polling.poll.modify(&polling.listener, Event::readable(0)) {
                        break 'run Err(err.into());
                    }
                } else if let Some(pos) = polling.clients.iter().position(|cc| cc.key == event.key)
                {
                    polling.clients[pos].last_update = Instant::now();

                    let deregister = match self.dispatch(
                        &mut polling.clients,
                        pos,
                        &mut next_session,
                        &delegate,
                        &mut captures,
                    ) {
                        Dispatch::Keep => None,
                        Dispatch::Close(cc) => Some(cc.socket),
                        Dispatch::Captured => None,
                    };

                    if let Some(socket) = deregister {
                        if let Err(err) = polling.poll.delete(&socket) {
                            log::error!("failed to deregister socket: {err}");
                        }

                        if delegate.on_client_disconnected(polling.clients.len())
                            == LoopAction::Exit
                        {
                            log::debug!("on_client_disconnected exited message loop");
                            break 'run Ok(());
                        }
                    } else if let Some(conn) = polling.clients.iter().find(|cc| cc.key == event.key)
                    {
                        if let Err(err) = polling
                            .poll
                            .modify(&conn.socket, Event::readable(conn.key))
                        {
                            break 'run Err(err.into());
                        }
                    } else if delegate.on_client_disconnected(polling.clients.len())
                        == LoopAction::Exit
                    {
                        // The connection was handed off to a capture worker
                        log::debug!("on_client_disconnected exited message loop");
                        break 'run Ok(());
                    }
                }
            }

            if let Some(st) = stale_timeout {
                let before = polling.clients.len();

                // Reap any connections that haven't sent a message in the
                // period specified by the user
                polling.clients.retain(|conn| {
                    let keep = conn.last_update.elapsed() < st;

                    if !keep {
                        log::debug!("dropping stale connection {:?}", conn.last_update.elapsed());
                        if let Err(err) = polling.poll.delete(&conn.socket) {
                            log::error!("failed to deregister timed-out socket: {err}");
                        }
                    }

                    keep
                });

                if before > polling.clients.len()
                    && delegate.on_client_disconnected(polling.clients.len()) == LoopAction::Exit
                {
                    log::debug!("on_client_disconnected exited message loop");
                    break 'run Ok(());
                }
            }
        };

        join_captures(captures, CAPTURE_GRACE);

        result
    }

    /// Receives and handles one message from the client at `pos`.
    fn dispatch(
        &self,
        clients: &mut Vec<ClientConn>,
        pos: usize,
        next_session: &mut u32,
        delegate: &Arc<dyn ServerDelegate>,
        captures: &mut Vec<std::thread::JoinHandle<()>>,
    ) -> Dispatch {
        let message = match clients[pos].recv() {
            Ok(Some(message)) => message,
            Ok(None) => {
                log::debug!("client closed socket {pos}");
                return Dispatch::Close(clients.swap_remove(pos));
            }
            Err(err) => {
                // Protocol mismatch or malformed framing; close the
                // connection without taking the server down with it
                log::error!("rejecting client message: {err}");
                return Dispatch::Close(clients.swap_remove(pos));
            }
        };

        match message {
            (
                Header {
                    kind: protocol::REGISTER,
                    ..
                },
                buffer,
            ) => {
                let annotations = match protocol::decode_annotations(&buffer) {
                    Ok(annotations) => annotations,
                    Err(err) => {
                        log::error!("malformed registration payload: {err}");
                        return Dispatch::Close(clients.swap_remove(pos));
                    }
                };

                let pid = clients[pos]
                    .socket
                    .0
                    .initial_peer_credentials()
                    .ok()
                    .and_then(|creds| creds.pid())
                    .map(|pid| pid.get());

                let session = *next_session;
                *next_session += 1;

                let conn = &mut clients[pos];
                conn.pid = pid;
                conn.session = Some(session);
                conn.annotations = self.base_annotations.clone();
                conn.annotations.extend(annotations);

                let mut ack = [0u8; std::mem::size_of::<Header>() + 4];
                ack[..std::mem::size_of::<Header>()]
                    .copy_from_slice(Header::new(protocol::REGISTER_ACK, 4).as_bytes());

                use scroll::Pwrite;
                if let Err(err) = ack.pwrite_with(
                    SessionId { id: session },
                    std::mem::size_of::<Header>(),
                    scroll::LE,
                ) {
                    log::error!("failed to encode registration ack: {err}");
                    return Dispatch::Close(clients.swap_remove(pos));
                }

                if let Err(err) = conn.socket.0.send(&ack) {
                    log::error!("failed to send registration ack: {err}");
                    return Dispatch::Close(clients.swap_remove(pos));
                }

                log::debug!("registered client session {session}");
                Dispatch::Keep
            }
            (
                Header {
                    kind: protocol::SET_ANNOTATIONS,
                    ..
                },
                buffer,
            ) => {
                match protocol::decode_annotations(&buffer) {
                    Ok(delta) => {
                        clients[pos].annotations.extend(delta);
                    }
                    Err(err) => {
                        log::error!("ignoring malformed annotation delta: {err}");
                    }
                }
                Dispatch::Keep
            }
            (
                Header {
                    kind: protocol::PING,
                    ..
                },
                _buffer,
            ) => {
                let pong = Header::new(protocol::PONG, 0);

                if let Err(err) = clients[pos].socket.0.send(pong.as_bytes()) {
                    log::error!("failed to send PONG: {err}");
                    return Dispatch::Close(clients.swap_remove(pos));
                }

                Dispatch::Keep
            }
            (
                Header {
                    kind: protocol::PONG,
                    ..
                },
                _buffer,
            ) => Dispatch::Keep,
            (
                Header {
                    kind: protocol::CRASH,
                    ..
                },
                buffer,
            ) => {
                let Some(event) = fault_context::CrashEvent::from_bytes(&buffer) else {
                    log::error!("client sent an incorrectly sized crash event");
                    return Dispatch::Close(clients.swap_remove(pos));
                };

                let cc = clients.swap_remove(pos);

                let (Some(pid), Some(_session)) = (cc.pid, cc.session) else {
                    log::error!("crash notification from an unregistered client: {}", Error::NotRegistered);
                    return Dispatch::Close(cc);
                };

                let store = self.store.clone();
                let delegate = delegate.clone();
                let annotations = cc.annotations.clone();

                captures.push(std::thread::spawn(move || {
                    let result =
                        handle_crash_request(pid as i32, &event, annotations, &store);

                    // The client is blocked waiting to die; always ack, even
                    // when the capture failed, so it can proceed
                    let ack = Header::new(protocol::CRASH_ACK, 0);
                    if let Err(err) = cc.socket.0.send(ack.as_bytes()) {
                        log::error!("failed to send ack: {err}");
                    }

                    match &result {
                        Ok(output) => {
                            log::info!(
                                "captured crash report {} for pid {pid}{}",
                                output.report.id,
                                if output.degraded { " (degraded)" } else { "" }
                            );
                        }
                        Err(err) => {
                            log::error!("failed to capture crash for pid {pid}: {err}");
                        }
                    }

                    delegate.on_capture(result);
                }));

                Dispatch::Captured
            }
            (header, _buffer) => {
                log::error!("ignoring message of unknown kind {}", header.kind);
                Dispatch::Keep
            }
        }
    }
}

enum Dispatch {
    /// The connection stays in the poll set
    Keep,
    /// The connection was removed and its socket should be deregistered
    Close(ClientConn),
    /// The connection was handed off to a capture worker; it was already
    /// removed from the poll set by the worker hand-off
    Captured,
}

/// Performs the full out-of-process capture for one crashed client.
///
/// A dump write failure skips report creation entirely; the event is only
/// logged by the caller.
fn handle_crash_request(
    pid: i32,
    event: &fault_context::CrashEvent,
    annotations: Annotations,
    store: &ReportStore,
) -> Result<CaptureOutput, Error> {
    let snapshot = ProcessSnapshot::capture(pid, event)?;

    let id = uuid::Uuid::new_v4();
    let artifact_path = store.artifact_path(id);

    dump::write(&artifact_path, &snapshot, event)?;

    let report = store.create(id, annotations)?;

    Ok(CaptureOutput {
        report,
        degraded: snapshot.degraded,
    })
}

/// Waits out in-flight capture workers, abandoning any that outlive the
/// grace period; their reports will simply be missing, the same as if the
/// supervisor had been killed outright.
fn join_captures(captures: Vec<std::thread::JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;

    for jh in captures {
        while !jh.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        if jh.is_finished() {
            let _ = jh.join();
        } else {
            log::warn!("abandoning in-flight capture at shutdown");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.listener.take();

        if let Some(path) = self.socket_path.take() {
            let _res = std::fs::remove_file(path);
        }
    }
}
