mod state;

use crate::Error;

/// The signals that we support intercepting
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    #[inline]
    pub fn ignore(self) {
        unsafe {
            state::ignore_signal(self);
        }
    }
}

/// A Linux/Android fault monitor.
///
/// Attaching installs the signal handlers, dropping (or [`Self::detach`])
/// restores whatever was installed before.
pub struct FaultMonitor;

#[allow(clippy::unused_self)]
impl FaultMonitor {
    /// Attaches the fault handlers.
    ///
    /// The provided callback will be invoked when one of the supported
    /// signals is raised, with a [`crate::CrashEvent`] describing the thread
    /// where it happened.
    ///
    /// The callback runs in a compromised context; it must not allocate or
    /// take locks ordinary program code might hold.
    pub fn attach(on_fault: Box<dyn crate::FaultEvent>) -> Result<Self, Error> {
        state::attach(on_fault)?;
        Ok(Self)
    }

    /// Detaches the monitor, restoring the previously installed or default
    /// handlers.
    ///
    /// This is done automatically when this [`FaultMonitor`] is dropped.
    #[inline]
    pub fn detach(self) {
        state::detach();
    }

    /// Set the process that is allowed to perform `ptrace` operations on the
    /// current process.
    ///
    /// The supervising process reads this process's memory while writing a
    /// dump, which `/proc/sys/kernel/yama/ptrace_scope` mode 1 forbids for
    /// non-ancestor processes. This sets `prctl(PR_SET_PTRACER, pid)` just
    /// before the fault callback runs; if never called, `PR_SET_PTRACER_ANY`
    /// is used so any supervisor can inspect us.
    ///
    /// See <https://www.kernel.org/doc/Documentation/security/Yama.txt> for
    /// the full documentation.
    #[inline]
    pub fn set_supervisor(&self, pid: Option<u32>) {
        let mut lock = state::HANDLER.lock();

        if let Some(handler) = &mut *lock {
            handler.supervisor = pid;
        }
    }

    /// Runs the fault callback as if the specified signal had been raised,
    /// without an actual fault.
    ///
    /// The returned disposition is handed back rather than acted on, so this
    /// is usable from tests.
    pub fn simulate_fault(&self, signal: Signal) -> Option<crate::FaultDisposition> {
        unsafe {
            let mut siginfo: libc::signalfd_siginfo = std::mem::zeroed();
            siginfo.ssi_code = state::SI_USER;
            siginfo.ssi_pid = std::process::id();
            siginfo.ssi_signo = signal as i32 as u32;

            let mut context: fault_context::ucontext_t = std::mem::zeroed();

            let lock = state::HANDLER.lock();
            lock.as_ref().map(|handler| {
                handler.handle_signal(
                    signal as i32,
                    &mut *(&mut siginfo as *mut libc::signalfd_siginfo).cast::<libc::siginfo_t>(),
                    (&mut context as *mut fault_context::ucontext_t).cast::<libc::c_void>(),
                )
            })
        }
    }
}

impl Drop for FaultMonitor {
    fn drop(&mut self) {
        state::detach();
    }
}
