//! Reads thread, stack, and module state out of a stopped process.
//!
//! Everything here runs in the supervisor, never in the crashed process, so
//! it is free to allocate and fail. Reads are best effort: a thread that
//! exits between enumeration and attach, or a stack page that cannot be
//! read, marks the snapshot degraded instead of aborting the capture.

use crate::Error;
use nix::{
    sys::{
        ptrace,
        wait::{waitpid, WaitPidFlag},
    },
    unistd::Pid,
};

/// Upper bound on the amount of stack memory captured per thread
pub const MAX_STACK_CAPTURE: usize = 64 * 1024;

/// The register file and a window of stack memory for one thread
pub struct ThreadState {
    pub tid: i32,
    /// Raw architecture register dump, opaque bytes as retrieved from the
    /// kernel
    pub registers: Vec<u8>,
    /// Address the captured stack window starts at
    pub stack_base: u64,
    pub stack: Vec<u8>,
}

/// One file-backed executable mapping
pub struct ModuleRecord {
    pub load_address: u64,
    pub path: String,
    /// GNU build id if the mapped file carries one, hex encoded
    pub build_id: Option<String>,
}

pub struct ProcessSnapshot {
    pub threads: Vec<ThreadState>,
    pub modules: Vec<ModuleRecord>,
    /// Set when any thread or memory read failed and the snapshot is partial
    pub degraded: bool,
}

impl ProcessSnapshot {
    /// Stops every thread of `pid` and reads out its state.
    ///
    /// The process stays stopped only for the duration of this call; all
    /// threads are detached before returning, including on the error path.
    ///
    /// # Errors
    ///
    /// Fails only when not even the faulting thread could be attached, eg
    /// the process is already gone or we lack ptrace rights. Anything short
    /// of that degrades the snapshot instead.
    pub fn capture(pid: i32, event: &fault_context::CrashEvent) -> Result<Self, Error> {
        let tids = enumerate_threads(pid)?;
        let maps = MemoryMaps::load(pid)?;

        let mut threads = Vec::with_capacity(tids.len());
        let mut degraded = false;
        let mut attached_any = false;
        let mut fault_err = None;

        for tid in tids {
            let guard = match AttachGuard::attach(tid) {
                Ok(guard) => guard,
                Err(err) => {
                    if tid == event.tid {
                        fault_err = Some(err);
                    }
                    degraded = true;
                    continue;
                }
            };

            attached_any = true;

            let registers = match read_registers(tid) {
                Ok(regs) => regs,
                Err(_err) => {
                    degraded = true;
                    Vec::new()
                }
            };

            // The signal handler already recorded the faulting thread's stack
            // pointer; for every other thread it comes from the register read
            let sp = if tid == event.tid {
                event.stack_pointer
            } else {
                stack_pointer(&registers).unwrap_or(0)
            };

            let (stack_base, stack) = match maps.containing(sp) {
                Some(mapping) => {
                    let end = mapping.end.min(sp.saturating_add(MAX_STACK_CAPTURE as u64));
                    let len = end.saturating_sub(sp) as usize;

                    match read_memory(tid, sp, len) {
                        Ok(bytes) => {
                            if bytes.len() < len {
                                degraded = true;
                            }
                            (sp, bytes)
                        }
                        Err(_err) => {
                            degraded = true;
                            (sp, Vec::new())
                        }
                    }
                }
                None => {
                    // A wild stack pointer, typical of stack overflow
                    degraded = true;
                    (sp, Vec::new())
                }
            };

            threads.push(ThreadState {
                tid,
                registers,
                stack_base,
                stack,
            });

            drop(guard);
        }

        if !attached_any {
            return Err(fault_err.unwrap_or(Error::Inspect {
                pid,
                source: nix::Error::ESRCH,
            }));
        }

        Ok(Self {
            threads,
            modules: maps.modules(),
            degraded,
        })
    }
}

/// Detaches on drop so a failure partway through a capture never leaves a
/// thread stopped
struct AttachGuard {
    tid: Pid,
}

impl AttachGuard {
    fn attach(tid: i32) -> Result<Self, Error> {
        let tid = Pid::from_raw(tid);

        ptrace::attach(tid).map_err(|source| Error::Inspect {
            pid: tid.as_raw(),
            source,
        })?;

        let guard = Self { tid };

        // __WALL because threads created with clone are not waitable
        // otherwise
        waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(|source| Error::Inspect {
            pid: tid.as_raw(),
            source,
        })?;

        Ok(guard)
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if let Err(err) = ptrace::detach(self.tid, None) {
            log::warn!("failed to detach from thread {}: {err}", self.tid);
        }
    }
}

fn enumerate_threads(pid: i32) -> Result<Vec<i32>, Error> {
    let mut tids = Vec::new();

    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            tids.push(tid);
        }
    }

    tids.sort_unstable();
    Ok(tids)
}

#[cfg(target_arch = "x86_64")]
fn read_registers(tid: i32) -> Result<Vec<u8>, Error> {
    let regs = ptrace::getregs(Pid::from_raw(tid)).map_err(|source| Error::Inspect {
        pid: tid,
        source,
    })?;

    // SAFETY: user_regs_struct is plain old data
    #[allow(unsafe_code)]
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (&regs as *const libc::user_regs_struct).cast::<u8>(),
            std::mem::size_of::<libc::user_regs_struct>(),
        )
    };

    Ok(bytes.to_vec())
}

#[cfg(target_arch = "aarch64")]
fn read_registers(tid: i32) -> Result<Vec<u8>, Error> {
    // nix doesn't expose getregs on aarch64 where PTRACE_GETREGS doesn't
    // exist, so issue PTRACE_GETREGSET with NT_PRSTATUS directly
    let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::uninit();
    let mut iov = libc::iovec {
        iov_base: regs.as_mut_ptr().cast(),
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };

    // SAFETY: the iovec points at storage of exactly the size the kernel
    // fills for NT_PRSTATUS
    #[allow(unsafe_code)]
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid,
            libc::NT_PRSTATUS,
            std::ptr::addr_of_mut!(iov),
        )
    };

    if ret == -1 {
        return Err(Error::Inspect {
            pid: tid,
            source: nix::Error::last(),
        });
    }

    // SAFETY: a successful GETREGSET initialized the struct
    #[allow(unsafe_code)]
    let regs = unsafe { regs.assume_init() };

    #[allow(unsafe_code)]
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (&regs as *const libc::user_regs_struct).cast::<u8>(),
            std::mem::size_of::<libc::user_regs_struct>(),
        )
    };

    Ok(bytes.to_vec())
}

/// Pulls the stack pointer back out of a raw register dump
fn stack_pointer(registers: &[u8]) -> Option<u64> {
    if registers.len() != std::mem::size_of::<libc::user_regs_struct>() {
        return None;
    }

    // SAFETY: length checked above, and the dump was produced from this
    // exact struct
    #[allow(unsafe_code)]
    let regs = unsafe { &*registers.as_ptr().cast::<libc::user_regs_struct>() };

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Some(regs.rsp)
        } else if #[cfg(target_arch = "aarch64")] {
            Some(regs.sp)
        } else {
            compile_error!("unsupported target architecture");
        }
    }
}

fn read_memory(tid: i32, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use std::io::IoSliceMut;

    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; len];

    let read = process_vm_readv(
        Pid::from_raw(tid),
        &mut [IoSliceMut::new(&mut buffer)],
        &[RemoteIoVec {
            base: addr as usize,
            len,
        }],
    )
    .map_err(|source| Error::Inspect { pid: tid, source })?;

    buffer.truncate(read);
    Ok(buffer)
}

struct Mapping {
    start: u64,
    end: u64,
    offset: u64,
    path: Option<String>,
}

/// Parsed `/proc/<pid>/maps`
struct MemoryMaps {
    mappings: Vec<Mapping>,
}

impl MemoryMaps {
    fn load(pid: i32) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;

        let mut mappings = Vec::new();

        for line in contents.lines() {
            // <start>-<end> <perms> <offset> <dev> <inode> [path]
            let mut fields = line.split_whitespace();

            let Some(range) = fields.next() else {
                continue;
            };
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end)) = (
                u64::from_str_radix(start, 16),
                u64::from_str_radix(end, 16),
            ) else {
                continue;
            };

            let _perms = fields.next();
            let offset = fields
                .next()
                .and_then(|off| u64::from_str_radix(off, 16).ok())
                .unwrap_or(0);
            let _dev = fields.next();
            let _inode = fields.next();
            let path = fields
                .next()
                .filter(|path| path.starts_with('/'))
                .map(String::from);

            mappings.push(Mapping {
                start,
                end,
                offset,
                path,
            });
        }

        Ok(Self { mappings })
    }

    fn containing(&self, addr: u64) -> Option<&Mapping> {
        self.mappings
            .iter()
            .find(|m| addr >= m.start && addr < m.end)
    }

    /// The module table: one record per file-backed mapping at offset zero,
    /// which is where each loaded object's ELF header lives
    fn modules(&self) -> Vec<ModuleRecord> {
        self.mappings
            .iter()
            .filter(|m| m.offset == 0)
            .filter_map(|m| {
                let path = m.path.as_deref()?;

                Some(ModuleRecord {
                    load_address: m.start,
                    path: path.to_owned(),
                    build_id: read_build_id(path),
                })
            })
            .collect()
    }
}

/// Reads the GNU build id note out of an ELF on disk. Any failure simply
/// yields no build id; symbolication can fall back to the path.
fn read_build_id(path: &str) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let elf = goblin::elf::Elf::parse(&bytes).ok()?;

    for note in elf.iter_note_headers(&bytes)? {
        let Ok(note) = note else {
            continue;
        };

        if note.n_type == goblin::elf::note::NT_GNU_BUILD_ID && note.name == "GNU" {
            let mut id = String::with_capacity(note.desc.len() * 2);
            for byte in note.desc {
                use std::fmt::Write;
                let _ = write!(&mut id, "{byte:02x}");
            }
            return Some(id);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_maps() {
        let maps = MemoryMaps {
            mappings: vec![
                Mapping {
                    start: 0x1000,
                    end: 0x2000,
                    offset: 0,
                    path: Some("/usr/lib/libc.so.6".to_owned()),
                },
                Mapping {
                    start: 0x7000_0000,
                    end: 0x7001_0000,
                    offset: 0,
                    path: None,
                },
            ],
        };

        assert_eq!(maps.containing(0x1800).unwrap().start, 0x1000);
        assert!(maps.containing(0x2000).is_none());

        // Anonymous mappings never become modules
        let modules = maps.modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].path, "/usr/lib/libc.so.6");
    }

    #[test]
    fn snapshots_own_threads() {
        // Capturing ourselves only works when the kernel allows same-uid
        // ptrace, which CI containers generally do
        let mut event = fault_context::CrashEvent::zeroed();

        let child = std::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        let mut reap = child;
        event.tid = pid;

        let snapshot = ProcessSnapshot::capture(pid, &event);

        let _ = reap.kill();
        let _ = reap.wait();

        let snapshot = snapshot.unwrap();
        assert!(!snapshot.threads.is_empty());
        assert!(snapshot
            .modules
            .iter()
            .any(|m| m.path.contains("sleep") || m.path.contains("/lib")));
    }
}
