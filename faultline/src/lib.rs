//! Out-of-process crash capture and reporting.
//!
//! A monitored process connects an [`ipc::Client`] to the supervising
//! handler process, registers with its annotations, and (via a crash
//! monitor) sends a minimal [`CrashEvent`] when it faults. The handler's
//! [`ipc::Server`] then inspects the crashed process from the outside,
//! writes a dump artifact, records a report in the [`store::ReportStore`],
//! and an [`upload::Uploader`] delivers it to a collector with retry and
//! backoff.
//!
//! All of the heavy lifting happens in the supervisor; the only code that
//! runs in the crashing process is the allocation-free client notify path.

#![deny(unsafe_code)]

mod errors;

pub use errors::Error;

pub mod dump;
pub mod protocol;
pub mod store;
pub mod upload;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod ipc;
        pub mod snapshot;
    } else {
        compile_error!("faultline is only supported on linux and android targets");
    }
}

pub use fault_context::CrashEvent;

/// Allows a [`ipc::ServerDelegate`] to stop the message loop from one of
/// its callbacks
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoopAction {
    Continue,
    Exit,
}
