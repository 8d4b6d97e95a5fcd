//! Harness for exercising the full pipeline: a real handler serving a real
//! child process that registers, annotates itself, and then actually
//! crashes.
//!
//! Also home to the fault generators the crash client uses; they live here
//! so tests can reference the same signal expectations.

use faultline::{
    ipc::{CaptureOutput, Server, ServerDelegate},
    protocol::Annotations,
    store::ReportStore,
    Error,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

/// The ways the crash client knows how to die
#[derive(Copy, Clone, Debug)]
pub enum CrashKind {
    Segv,
    Abort,
}

impl CrashKind {
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Segv => "segv",
            Self::Abort => "abort",
        }
    }

    /// The signal the client process is expected to terminate with, given
    /// that its fault callback re-raises
    pub fn expected_signal(self) -> i32 {
        match self {
            Self::Segv => libc::SIGSEGV,
            Self::Abort => libc::SIGABRT,
        }
    }
}

/// Dereferences null.
///
/// # Safety
///
/// Not safe, that being rather the point.
#[allow(unsafe_code)]
pub fn raise_segfault() -> ! {
    unsafe {
        std::ptr::null_mut::<u32>().write_volatile(42);
        std::hint::unreachable_unchecked()
    }
}

#[allow(unsafe_code)]
pub fn raise_abort() -> ! {
    unsafe { libc::abort() }
}

struct CaptureSink {
    tx: Mutex<mpsc::Sender<Result<CaptureOutput, Error>>>,
}

impl ServerDelegate for CaptureSink {
    fn on_capture(&self, result: Result<CaptureOutput, Error>) {
        let _res = self.tx.lock().expect("poisoned").send(result);
    }
}

/// One handler instance serving one test, with its own store directory and
/// its own abstract socket
pub struct TestHandler {
    store: Arc<ReportStore>,
    socket: String,
    shutdown: Arc<AtomicBool>,
    server: Option<std::thread::JoinHandle<Result<(), Error>>>,
    rx: mpsc::Receiver<Result<CaptureOutput, Error>>,
    _td: tempfile::TempDir,
}

impl TestHandler {
    /// Binds a handler on a socket name unique to this test and process and
    /// runs its message loop on a background thread.
    pub fn spinup(test: &str) -> Self {
        let td = tempfile::tempdir().expect("failed to create store dir");
        let store = Arc::new(ReportStore::open(td.path()).expect("failed to open store"));

        let socket = format!("faultline-test-{test}-{}", std::process::id());

        let mut base = Annotations::new();
        base.insert("harness".to_owned(), test.to_owned());

        let mut server = Server::with_name(socket.as_str(), store.clone(), base)
            .expect("failed to bind server socket");

        let (tx, rx) = mpsc::channel();
        let delegate = Arc::new(CaptureSink { tx: Mutex::new(tx) });

        let shutdown = Arc::new(AtomicBool::new(false));
        let sd = shutdown.clone();

        let server = std::thread::spawn(move || server.run(delegate, &sd, None));

        Self {
            store,
            socket,
            shutdown,
            server: Some(server),
            rx,
            _td: td,
        }
    }

    pub fn socket(&self) -> &str {
        &self.socket
    }

    pub fn store(&self) -> &Arc<ReportStore> {
        &self.store
    }

    /// Blocks until the handler finishes one crash capture
    pub fn wait_capture(&self, timeout: Duration) -> CaptureOutput {
        self.rx
            .recv_timeout(timeout)
            .expect("timed out waiting for a capture")
            .expect("capture failed")
    }

    /// Stops the message loop and hands the store back for assertions
    pub fn shutdown(mut self) -> Arc<ReportStore> {
        self.stop();
        self.store.clone()
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(server) = self.server.take() {
            server
                .join()
                .expect("server thread panicked")
                .expect("server loop failed");
        }
    }
}

impl Drop for TestHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Locates the crash client binary next to the test executable
fn client_binary() -> PathBuf {
    let mut path = std::env::current_exe().expect("failed to get test executable path");
    path.pop();

    if path.ends_with("deps") {
        path.pop();
    }

    path.push("crash-client");
    path
}

/// Runs the crash client against `socket` and waits for it to die
pub fn run_crash_client(socket: &str, kind: CrashKind, threads: u32) -> std::process::ExitStatus {
    std::process::Command::new(client_binary())
        .args([
            "--socket",
            socket,
            "--signal",
            kind.as_arg(),
            "--threads",
            &threads.to_string(),
        ])
        .status()
        .expect("failed to run crash-client")
}

/// The standard scenario: spin up a handler, crash a client under it, and
/// check the resulting report and artifact.
pub fn assert_crash_captured(kind: CrashKind) {
    use std::os::unix::process::ExitStatusExt;

    const EXTRA_THREADS: u32 = 2;

    let handler = TestHandler::spinup(kind.as_arg());

    let status = run_crash_client(handler.socket(), kind, EXTRA_THREADS);
    assert_eq!(
        status.signal(),
        Some(kind.expected_signal()),
        "client should have died re-raising its fault, got {status:?}"
    );

    let capture = handler.wait_capture(Duration::from_secs(30));
    let store = handler.shutdown();

    let report = store.get(capture.report.id).expect("report not in store");
    assert_eq!(report.state, faultline::store::ReportState::Pending);

    // Base annotations from the handler, registration set from the client,
    // and the late delta must all be present
    assert_eq!(report.annotations.get("harness").map(String::as_str), Some(kind.as_arg()));
    assert_eq!(report.annotations.get("ver").map(String::as_str), Some("1.0"));
    assert_eq!(report.annotations.get("stage").map(String::as_str), Some("late"));

    let artifact = faultline::dump::read(&report.artifact).expect("artifact unreadable");

    assert_eq!(artifact.header.platform, faultline::dump::PLATFORM_LINUX);
    assert_eq!(artifact.crash.signal, kind.expected_signal());

    // Main thread, the spawned ones, and whatever the runtime adds
    assert!(
        artifact.threads.len() as u32 > EXTRA_THREADS,
        "expected more than {EXTRA_THREADS} threads, got {}",
        artifact.threads.len()
    );

    // The faulting thread must be in the table
    assert!(
        artifact
            .threads
            .iter()
            .any(|thread| thread.tid == artifact.crash.tid),
        "faulting tid {} missing from thread table",
        artifact.crash.tid
    );

    // The faulting thread's registers were read by the supervisor
    let faulting = artifact
        .threads
        .iter()
        .find(|thread| thread.tid == artifact.crash.tid)
        .unwrap();
    assert!(!faulting.registers.is_empty());

    // Something got mapped from disk
    assert!(!artifact.modules.is_empty());
}
