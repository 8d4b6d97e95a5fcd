//! The process that actually crashes: registers with the handler, attaches
//! the fault monitor, optionally spins up extra threads, then faults the way
//! it was told to.

use clap::Parser;
use fault_monitor::{FaultDisposition, FaultMonitor};
use faultline::{ipc::Client, protocol::Annotations};
use std::time::Duration;

#[derive(Parser)]
struct Args {
    /// Abstract socket name of the handler
    #[arg(long)]
    socket: String,
    /// Which fault to raise: segv or abort
    #[arg(long)]
    signal: String,
    /// Extra idle threads to spawn before crashing
    #[arg(long, default_value_t = 0)]
    threads: u32,
}

fn main() {
    let args = Args::parse();

    let client = Client::with_name(args.socket.as_str()).expect("failed to connect to handler");

    let mut annotations = Annotations::new();
    annotations.insert("ver".to_owned(), "1.0".to_owned());

    client
        .register(&annotations, Duration::from_secs(5))
        .expect("failed to register");

    let mut delta = Annotations::new();
    delta.insert("stage".to_owned(), "late".to_owned());
    client.set_annotations(&delta).expect("failed to annotate");

    #[allow(unsafe_code)]
    let _monitor = FaultMonitor::attach(unsafe {
        fault_monitor::make_fault_event(move |event| {
            // The handler captures us while we block on the ack
            let _res = client.notify_crash(event, Duration::from_secs(30));
            FaultDisposition::Reraise
        })
    })
    .expect("failed to attach fault monitor");

    for _ in 0..args.threads {
        std::thread::spawn(|| loop {
            std::thread::sleep(Duration::from_secs(60));
        });
    }

    // Give the idle threads a beat to actually start
    std::thread::sleep(Duration::from_millis(100));

    match args.signal.as_str() {
        "segv" => faultline_test::raise_segfault(),
        "abort" => faultline_test::raise_abort(),
        other => {
            eprintln!("unknown signal kind '{other}'");
            std::process::exit(1);
        }
    }
}
