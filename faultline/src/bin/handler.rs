//! The supervising handler process: binds the crash socket, serves client
//! registrations and crash captures, and uploads finished reports.

use clap::Parser;
use faultline::{
    ipc::{CaptureOutput, Server, ServerDelegate, SocketName},
    protocol::Annotations,
    store::ReportStore,
    upload::{uploads_enabled_from_env, UploadConfig, Uploader},
    Error,
};
use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "faultline-handler", version, about)]
struct Args {
    /// Directory the report store lives in
    #[arg(long)]
    database: PathBuf,
    /// Collector endpoint; uploads are disabled when omitted
    #[arg(long)]
    url: Option<String>,
    /// key=value annotation attached to every report, repeatable
    #[arg(long = "annotation", value_parser = parse_annotation)]
    annotations: Vec<(String, String)>,
    /// Maximum uploads per minute
    #[arg(long)]
    rate_limit: Option<u32>,
    /// Socket name clients connect to; an absolute path binds a filesystem
    /// socket, anything else an abstract one
    #[arg(long, default_value = "faultline-handler")]
    socket: String,
    /// Drop client connections silent for this many seconds
    #[arg(long)]
    stale_timeout: Option<u64>,
}

fn parse_annotation(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("'{s}' is not of the form key=value"))
}

struct HandlerDelegate;

impl ServerDelegate for HandlerDelegate {
    fn on_capture(&self, result: Result<CaptureOutput, Error>) {
        // The server already logs each outcome; nothing else for the
        // standalone handler to do with it
        let _res = result;
    }
}

extern "C" fn on_signal(_signum: i32) {
    SHUTDOWN.store(true, std::sync::atomic::Ordering::Relaxed);
}

fn install_shutdown_handlers() {
    // SAFETY: the handler only stores to an atomic
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let store = match ReportStore::open(&args.database) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            log::error!(
                "report store at {} is unusable: {err}",
                args.database.display()
            );
            std::process::exit(2);
        }
    };

    let base_annotations: Annotations = args.annotations.iter().cloned().collect();

    let socket_name = if args.socket.starts_with('/') {
        SocketName::Path(Path::new(&args.socket))
    } else {
        SocketName::Abstract(&args.socket)
    };

    let mut server = match Server::with_name(socket_name, store.clone(), base_annotations) {
        Ok(server) => server,
        Err(err) => {
            log::error!("failed to bind socket '{}': {err}", args.socket);
            std::process::exit(1);
        }
    };

    install_shutdown_handlers();

    let mut upload_threads = Vec::new();

    if let Some(url) = args.url {
        let mut config = UploadConfig::new(url);
        config.enabled = uploads_enabled_from_env();
        config.rate_limit = args.rate_limit;

        if !config.enabled {
            log::info!("uploads disabled by environment, reports will stay pending");
        }

        match Uploader::new(store, config) {
            Ok(uploader) => {
                let uploader = Arc::new(uploader);

                for _ in 0..uploader.concurrency() {
                    let uploader = uploader.clone();
                    upload_threads.push(std::thread::spawn(move || {
                        uploader.run(&SHUTDOWN);
                    }));
                }
            }
            Err(err) => {
                log::error!("failed to construct uploader, uploads disabled: {err}");
            }
        }
    } else {
        log::info!("no collector url configured, reports will stay pending");
    }

    let exit_code = match server.run(
        Arc::new(HandlerDelegate),
        &SHUTDOWN,
        args.stale_timeout.map(Duration::from_secs),
    ) {
        Ok(()) => {
            log::info!("shutting down");
            0
        }
        Err(err) => {
            log::error!("server loop failed: {err}");
            1
        }
    };

    SHUTDOWN.store(true, std::sync::atomic::Ordering::Relaxed);

    for jh in upload_threads {
        let _res = jh.join();
    }

    std::process::exit(exit_code);
}
