//! The Dump Writer: serializes a [`ProcessSnapshot`] plus the crash event
//! into the on-disk artifact.
//!
//! The layout is fixed little-endian: a header, a thread table, a module
//! table, and a trailing crash record. Artifacts are write once; the writer
//! syncs before reporting success so a report record never points at a
//! half-written file.

use crate::{snapshot::ProcessSnapshot, Error};
use scroll::{Pread, Pwrite, LE};
use std::path::Path;

/// `FLDM`
pub const DUMP_MAGIC: u32 = 0x464c_444d;
pub const DUMP_VERSION: u32 = 1;

pub const PLATFORM_LINUX: u32 = 1;

pub const ARCH_X86_64: u32 = 1;
pub const ARCH_AARCH64: u32 = 2;

/// Set when parts of the crashed process could not be read and the artifact
/// is partial
pub const FLAG_DEGRADED: u32 = 1 << 0;

/// Serialized sizes, which differ from `size_of` since the wire layout has
/// no padding
const HEADER_SIZE: usize = 5 * 4 + 8;
const CRASH_RECORD_SIZE: usize = 3 * 4;

#[derive(Copy, Clone, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
#[cfg_attr(test, derive(Debug))]
pub struct DumpHeader {
    pub magic: u32,
    pub version: u32,
    pub platform: u32,
    pub arch: u32,
    pub flags: u32,
    /// Unix seconds at which the artifact was written
    pub created_at: u64,
}

/// The trailing record identifying what actually went wrong
#[derive(Copy, Clone, scroll::Pread, scroll::Pwrite, scroll::SizeWith)]
#[cfg_attr(test, derive(Debug))]
pub struct CrashRecord {
    pub signal: i32,
    pub code: i32,
    pub tid: u32,
}

/// One deserialized thread table entry
pub struct ThreadEntry {
    pub tid: u32,
    pub registers: Vec<u8>,
    pub stack_base: u64,
    pub stack: Vec<u8>,
}

/// One deserialized module table entry
pub struct ModuleEntry {
    pub load_address: u64,
    pub path: String,
    pub build_id: Option<String>,
}

/// A fully deserialized artifact, used by tests and tooling; the upload path
/// only ever streams the raw bytes
pub struct DumpArtifact {
    pub header: DumpHeader,
    pub threads: Vec<ThreadEntry>,
    pub modules: Vec<ModuleEntry>,
    pub crash: CrashRecord,
}

#[inline]
fn arch_id() -> u32 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            ARCH_X86_64
        } else if #[cfg(target_arch = "aarch64")] {
            ARCH_AARCH64
        } else {
            compile_error!("unsupported target architecture");
        }
    }
}

/// Writes the artifact for one capture to `path` and syncs it to disk.
///
/// # Errors
///
/// Disk full, permissions, and the like. The caller is expected to skip
/// report creation on failure so no record ever points at a missing or
/// truncated artifact.
pub fn write(
    path: &Path,
    snapshot: &ProcessSnapshot,
    event: &fault_context::CrashEvent,
) -> Result<(), Error> {
    use std::io::Write;

    let buffer = serialize(snapshot, event)?;

    let mut file = std::fs::File::create(path)?;
    file.write_all(&buffer)?;
    file.sync_all()?;

    Ok(())
}

fn serialize(
    snapshot: &ProcessSnapshot,
    event: &fault_context::CrashEvent,
) -> Result<Vec<u8>, Error> {
    let header = DumpHeader {
        magic: DUMP_MAGIC,
        version: DUMP_VERSION,
        platform: PLATFORM_LINUX,
        arch: arch_id(),
        flags: if snapshot.degraded { FLAG_DEGRADED } else { 0 },
        created_at: event.timestamp,
    };

    let mut size = HEADER_SIZE + CRASH_RECORD_SIZE;

    size += 4;
    for thread in &snapshot.threads {
        size += 4 + 4 + thread.registers.len() + 8 + 4 + thread.stack.len();
    }

    size += 4;
    for module in &snapshot.modules {
        let build_id_len = module.build_id.as_deref().map_or(0, str::len);
        size += 8 + 4 + module.path.len() + 4 + build_id_len;
    }

    let mut buffer = vec![0u8; size];
    let mut offset = 0;

    buffer.gwrite_with(header, &mut offset, LE)?;

    buffer.gwrite_with(snapshot.threads.len() as u32, &mut offset, LE)?;
    for thread in &snapshot.threads {
        buffer.gwrite_with(thread.tid as u32, &mut offset, LE)?;
        buffer.gwrite_with(thread.registers.len() as u32, &mut offset, LE)?;
        buffer.gwrite_with(thread.registers.as_slice(), &mut offset, ())?;
        buffer.gwrite_with(thread.stack_base, &mut offset, LE)?;
        buffer.gwrite_with(thread.stack.len() as u32, &mut offset, LE)?;
        buffer.gwrite_with(thread.stack.as_slice(), &mut offset, ())?;
    }

    buffer.gwrite_with(snapshot.modules.len() as u32, &mut offset, LE)?;
    for module in &snapshot.modules {
        let build_id = module.build_id.as_deref().unwrap_or("");

        buffer.gwrite_with(module.load_address, &mut offset, LE)?;
        buffer.gwrite_with(module.path.len() as u32, &mut offset, LE)?;
        buffer.gwrite_with(module.path.as_bytes(), &mut offset, ())?;
        buffer.gwrite_with(build_id.len() as u32, &mut offset, LE)?;
        buffer.gwrite_with(build_id.as_bytes(), &mut offset, ())?;
    }

    buffer.gwrite_with(
        CrashRecord {
            signal: event.signal,
            code: event.code,
            tid: event.tid as u32,
        },
        &mut offset,
        LE,
    )?;

    debug_assert_eq!(offset, size);

    Ok(buffer)
}

/// Reads an artifact back in full.
///
/// # Errors
///
/// I/O failure, or [`Error::CorruptArtifact`] when the file is truncated,
/// carries the wrong magic, or claims a version this build does not know.
pub fn read(path: &Path) -> Result<DumpArtifact, Error> {
    let buffer = std::fs::read(path)?;
    deserialize(&buffer)
}

fn deserialize(buffer: &[u8]) -> Result<DumpArtifact, Error> {
    let mut offset = 0;

    let header: DumpHeader = buffer
        .gread_with(&mut offset, LE)
        .map_err(|_: scroll::Error| Error::CorruptArtifact)?;

    if header.magic != DUMP_MAGIC || header.version != DUMP_VERSION {
        return Err(Error::CorruptArtifact);
    }

    let corrupt = |_: scroll::Error| Error::CorruptArtifact;

    let thread_count: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
    let mut threads = Vec::with_capacity(thread_count.min(1024) as usize);

    for _ in 0..thread_count {
        let tid: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;

        let reg_len: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
        let registers: &[u8] = buffer
            .gread_with(&mut offset, reg_len as usize)
            .map_err(corrupt)?;

        let stack_base: u64 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;

        let stack_len: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
        let stack: &[u8] = buffer
            .gread_with(&mut offset, stack_len as usize)
            .map_err(corrupt)?;

        threads.push(ThreadEntry {
            tid,
            registers: registers.to_vec(),
            stack_base,
            stack: stack.to_vec(),
        });
    }

    let module_count: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
    let mut modules = Vec::with_capacity(module_count.min(1024) as usize);

    for _ in 0..module_count {
        let load_address: u64 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;

        let path_len: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
        let path: &[u8] = buffer
            .gread_with(&mut offset, path_len as usize)
            .map_err(corrupt)?;
        let path = std::str::from_utf8(path)
            .map_err(|_err| Error::CorruptArtifact)?
            .to_owned();

        let id_len: u32 = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;
        let build_id: &[u8] = buffer
            .gread_with(&mut offset, id_len as usize)
            .map_err(corrupt)?;
        let build_id = if build_id.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(build_id)
                    .map_err(|_err| Error::CorruptArtifact)?
                    .to_owned(),
            )
        };

        modules.push(ModuleEntry {
            load_address,
            path,
            build_id,
        });
    }

    let crash: CrashRecord = buffer.gread_with(&mut offset, LE).map_err(corrupt)?;

    Ok(DumpArtifact {
        header,
        threads,
        modules,
        crash,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::snapshot::{ModuleRecord, ThreadState};

    fn sample_snapshot(degraded: bool) -> ProcessSnapshot {
        ProcessSnapshot {
            threads: vec![
                ThreadState {
                    tid: 1000,
                    registers: vec![1, 2, 3, 4, 5, 6, 7, 8],
                    stack_base: 0x7fff_0000,
                    stack: vec![0xaa; 256],
                },
                ThreadState {
                    tid: 1001,
                    registers: Vec::new(),
                    stack_base: 0,
                    stack: Vec::new(),
                },
            ],
            modules: vec![ModuleRecord {
                load_address: 0x40_0000,
                path: "/usr/bin/app".to_owned(),
                build_id: Some("f00dfaceb00f".to_owned()),
            }],
            degraded,
        }
    }

    fn sample_event() -> fault_context::CrashEvent {
        let mut event = fault_context::CrashEvent::zeroed();
        event.tid = 1000;
        event.signal = libc::SIGSEGV;
        event.code = 1; // SEGV_MAPERR
        event.timestamp = 1_700_000_000;
        event
    }

    #[test]
    fn artifact_round_trip() {
        let buffer = serialize(&sample_snapshot(true), &sample_event()).unwrap();
        let artifact = deserialize(&buffer).unwrap();

        assert_eq!(artifact.header.magic, DUMP_MAGIC);
        assert_eq!(artifact.header.platform, PLATFORM_LINUX);
        assert_eq!(artifact.header.flags & FLAG_DEGRADED, FLAG_DEGRADED);
        assert_eq!(artifact.header.created_at, 1_700_000_000);

        assert_eq!(artifact.threads.len(), 2);
        assert_eq!(artifact.threads[0].tid, 1000);
        assert_eq!(artifact.threads[0].registers, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(artifact.threads[0].stack_base, 0x7fff_0000);
        assert_eq!(artifact.threads[0].stack.len(), 256);
        assert!(artifact.threads[1].stack.is_empty());

        assert_eq!(artifact.modules.len(), 1);
        assert_eq!(artifact.modules[0].path, "/usr/bin/app");
        assert_eq!(artifact.modules[0].build_id.as_deref(), Some("f00dfaceb00f"));

        assert_eq!(artifact.crash.signal, libc::SIGSEGV);
        assert_eq!(artifact.crash.tid, 1000);
    }

    #[test]
    fn rejects_truncation() {
        let buffer = serialize(&sample_snapshot(false), &sample_event()).unwrap();

        // Any prefix short of the full artifact must be rejected, not
        // misread
        for len in [0, 4, HEADER_SIZE, buffer.len() - 1] {
            assert!(matches!(
                deserialize(&buffer[..len]),
                Err(Error::CorruptArtifact)
            ));
        }
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut buffer = serialize(&sample_snapshot(false), &sample_event()).unwrap();
        buffer[0] ^= 0xff;

        assert!(matches!(deserialize(&buffer), Err(Error::CorruptArtifact)));
    }
}
