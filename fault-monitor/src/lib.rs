//! [`FaultMonitor`] installs fault handlers in the current process and runs a
//! user-specified callback with a minimal [`CrashEvent`] when one fires.
//!
//! On Linux this is done by handling [signals](https://man7.org/linux/man-pages/man7/signal.7.html)
//! covering the fatal failure classes a crash reporter cares about:
//!
//! - `SIGABRT` — abnormal termination requests, e.g. `std::process::abort`
//! - `SIGBUS` — bus errors
//! - `SIGFPE` — erroneous arithmetic operations, integer ones included
//! - `SIGILL` — illegal, malformed, or privileged instructions
//! - `SIGSEGV` — invalid virtual memory references, including stack overflows
//! - `SIGTRAP` — traps, e.g. breakpoints and debug assertions
//!
//! The callback runs in a compromised context. Only a small subset of libc is
//! [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html),
//! and calling anything else, `malloc` very much included, is undefined
//! behavior. Everything this crate does on the fault path works on storage
//! reserved at attach time; callbacks are expected to hold themselves to the
//! same standard, typically by doing nothing beyond writing the provided
//! event to a channel that was established before the monitor was attached.
//!
//! The monitor is an explicit lifecycle object: attach it once during process
//! startup, keep the handle alive for as long as faults should be reported,
//! and drop it (or call [`FaultMonitor::detach`]) to restore the previously
//! installed handlers. The interior statics exist only because the kernel
//! hands signals to a bare function pointer; all initialization and teardown
//! flows through the handle.

#![allow(unsafe_code)]

mod error;

pub use error::Error;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

pub use fault_context::CrashEvent;

/// What the faulting process should do once the user callback, and whatever
/// supervisor round-trip it performed, has completed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FaultDisposition {
    /// Restore the default handler and let the original fault run its course,
    /// terminating the process with the original signal
    Reraise,
    /// Exit immediately with the conventional `128 + signal` exit code
    Terminate,
    /// Restore the handlers that were installed before the monitor attached
    /// and hand the fault to them
    Passthrough,
}

/// User implemented trait for handling a fault that has occurred.
///
/// # Safety
///
/// This trait is marked unsafe as care needs to be taken when implementing it
/// due to the [`Self::on_fault`] method being run in a compromised context. In
/// general, it is advised to do as _little_ as possible when handling a fault,
/// with anything complicated or allocation-prone initialized before the
/// [`FaultMonitor`] is attached, or hoisted out to another process entirely.
pub unsafe trait FaultEvent: Send + Sync {
    /// Method invoked when a fault occurs. The returned disposition decides
    /// whether the fault is re-raised, the process terminates, or the
    /// previously installed handlers get a chance to run.
    fn on_fault(&self, event: &CrashEvent) -> FaultDisposition;
}

/// Creates a [`FaultEvent`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`FaultEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_fault_event<F>(closure: F) -> Box<dyn FaultEvent>
where
    F: Send + Sync + Fn(&CrashEvent) -> FaultDisposition + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> FaultEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&CrashEvent) -> FaultDisposition,
    {
        fn on_fault(&self, event: &CrashEvent) -> FaultDisposition {
            (self.inner)(event)
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{FaultMonitor, Signal};
    } else {
        compile_error!("fault-monitor is only implemented for linux and android");
    }
}
