//! Portable, fixed-size types describing the state of a thread at the moment
//! it faulted.
//!
//! Everything in this crate is built to be populated from inside a signal
//! handler: all types are `#[repr(C)]` with a size known at compile time,
//! serialization is a byte-copy, and no code path allocates. The event is
//! intended to be kept in pre-reserved storage (e.g. a `.bss` static) by the
//! component installing the fault handlers and handed to the supervising
//! process over an already-established channel.

#![allow(unsafe_code)]
#![allow(non_camel_case_types)]

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{mcontext_t, sigset_t, stack_t, ucontext_t};
    } else {
        compile_error!("fault-context is only implemented for linux and android");
    }
}

/// The maximum number of general purpose register values captured for the
/// faulting thread, large enough for every supported architecture.
pub const MAX_REGISTERS: usize = 34;

/// General purpose register snapshot of the faulting thread.
///
/// The layout of `values` is architecture specific; consumers that need to
/// interpret individual registers should use [`CrashEvent::instruction_pointer`]
/// and [`CrashEvent::stack_pointer`] which are extracted at capture time.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RegisterSnapshot {
    /// Number of valid entries in `values`
    pub count: u32,
    _pad: u32,
    pub values: [u64; MAX_REGISTERS],
}

impl RegisterSnapshot {
    #[inline]
    pub fn empty() -> Self {
        Self {
            count: 0,
            _pad: 0,
            values: [0; MAX_REGISTERS],
        }
    }

    /// The valid portion of the register file.
    #[inline]
    pub fn as_slice(&self) -> &[u64] {
        let count = (self.count as usize).min(MAX_REGISTERS);
        &self.values[..count]
    }
}

/// The minimal description of a fault, captured synchronously inside the
/// signal handler of the crashing thread.
///
/// Immutable once captured. The supervising process performs the full state
/// walk itself; this struct only carries what cannot be recovered externally,
/// namely which thread faulted, why, and its register file at the instant of
/// the fault.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CrashEvent {
    /// The id of the faulting thread
    pub tid: i32,
    /// The signal that was raised
    pub signal: i32,
    /// The `si_code` accompanying the signal
    pub code: i32,
    _pad: i32,
    /// The address whose access faulted, when the signal provides one
    pub fault_address: u64,
    /// Instruction pointer of the faulting thread
    pub instruction_pointer: u64,
    /// Stack pointer of the faulting thread
    pub stack_pointer: u64,
    /// Wall-clock capture time, seconds since the unix epoch
    pub timestamp: u64,
    /// General purpose registers of the faulting thread
    pub registers: RegisterSnapshot,
}

impl CrashEvent {
    /// A zeroed event, suitable for pre-reserving static storage that a
    /// signal handler later fills via [`CrashEvent::fill`].
    #[inline]
    pub fn zeroed() -> Self {
        // SAFETY: CrashEvent is repr(C) and contains no references or
        // padding-sensitive types, all-zeroes is a valid value
        unsafe { std::mem::zeroed() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let size = std::mem::size_of_val(self);
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<Self>() {
            return None;
        }

        unsafe { Some(*bytes.as_ptr().cast::<Self>()) }
    }
}

#[cfg(test)]
mod test {
    use super::CrashEvent;

    #[test]
    fn event_bytes() {
        let mut expected = CrashEvent::zeroed();
        expected.tid = 1021;
        expected.signal = libc::SIGSEGV;
        expected.fault_address = 0xdead_beef;
        expected.registers.count = 3;
        expected.registers.values[2] = 42;

        let actual = CrashEvent::from_bytes(expected.as_bytes()).unwrap();

        assert_eq!(expected.tid, actual.tid);
        assert_eq!(expected.signal, actual.signal);
        assert_eq!(expected.fault_address, actual.fault_address);
        assert_eq!(expected.registers.as_slice(), actual.registers.as_slice());
    }

    #[test]
    fn rejects_wrong_size() {
        let event = CrashEvent::zeroed();
        let bytes = event.as_bytes();
        assert!(CrashEvent::from_bytes(&bytes[1..]).is_none());
    }
}
