use crate::CrashEvent;

#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    #[cfg(target_pointer_width = "32")]
    __val: [u32; 32],
    #[cfg(target_pointer_width = "64")]
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut std::ffi::c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        // We define the ucontext layout ourselves instead of using libc's, as
        // libc's differs between glibc and musl even though the ucontext_t
        // received from a signal is the same regardless of the libc in use,
        // it is only arch specific
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
            pub uc_sigmask: sigset_t,
            __private: [u8; 512],
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub gregs: [i64; 23],
            pub fpregs: *mut std::ffi::c_void,
            __reserved: [u64; 8],
        }

        /// Index of `RSP` in `mcontext_t::gregs`
        const REG_SP: usize = 15;
        /// Index of `RIP` in `mcontext_t::gregs`
        const REG_IP: usize = 16;
        const REG_COUNT: usize = 23;
    } else if #[cfg(target_arch = "aarch64")] {
        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: sigset_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C, align(16))]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
            // Holds the fpsimd context, which we don't capture
            __reserved: [u8; 4096],
        }

        const REG_COUNT: usize = 34;
    } else {
        compile_error!("unimplemented target architecture");
    }
}

impl CrashEvent {
    /// Populates this event from the raw signal handler arguments.
    ///
    /// Performs no allocation, intended to be invoked on an event kept in
    /// static storage.
    ///
    /// # Safety
    ///
    /// `uc` must be the valid `ucontext_t` pointer the kernel passed to a
    /// `SA_SIGINFO` signal handler.
    pub unsafe fn fill(
        &mut self,
        signal: i32,
        info: &libc::signalfd_siginfo,
        uc: *const libc::c_void,
        tid: i32,
    ) {
        let uc = &*uc.cast::<ucontext_t>();

        self.tid = tid;
        self.signal = signal;
        self.code = info.ssi_code;
        self.fault_address = info.ssi_addr;
        self.timestamp = realtime_secs();

        self.registers.count = REG_COUNT as u32;

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let gregs = &uc.uc_mcontext.gregs;
                for (dst, src) in self.registers.values[..REG_COUNT].iter_mut().zip(gregs.iter()) {
                    *dst = *src as u64;
                }

                self.instruction_pointer = gregs[REG_IP] as u64;
                self.stack_pointer = gregs[REG_SP] as u64;
            } else if #[cfg(target_arch = "aarch64")] {
                let mc = &uc.uc_mcontext;
                self.registers.values[..31].copy_from_slice(&mc.regs);
                self.registers.values[31] = mc.sp;
                self.registers.values[32] = mc.pc;
                self.registers.values[33] = mc.pstate;

                debug_assert!(REG_COUNT <= crate::MAX_REGISTERS);

                self.instruction_pointer = mc.pc;
                self.stack_pointer = mc.sp;
            }
        }
    }
}

/// Wall clock reading that is legal inside a signal handler, unlike
/// `std::time::SystemTime::now` which is not guaranteed to be
#[inline]
fn realtime_secs() -> u64 {
    unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        if libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) == 0 {
            ts.tv_sec as u64
        } else {
            0
        }
    }
}

#[cfg(test)]
mod test {
    // Musl's ucontext_t lacks fpregs because of an old libc disagreement, so
    // only compare sizes on gnu targets
    #[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
    #[test]
    fn matches_libc() {
        assert_eq!(
            std::mem::size_of::<libc::ucontext_t>(),
            std::mem::size_of::<super::ucontext_t>()
        );
    }
}
