//! Raw byte-range advisory locking over a single-byte offset in a file.
//!
//! Grounded on `original_source/CompoundFs/FileLockLinux.cpp` /
//! `PosixFile.cpp`, which place OS advisory locks on named single-byte
//! ranges near the top of the file's address space. Uses Linux's
//! open-file-description (OFD) locks where available — unlike classic
//! POSIX record locks, OFD locks are per-file-description rather than
//! per-process, so multiple lock handles in the same process (as our
//! reader/writer split requires) behave correctly. Falls back to classic
//! `F_SETLK`/`F_SETLKW` on platforms without OFD locks.

use common::{CoreError, DbResult};
use std::fs::File;
use std::os::unix::io::AsRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Attempts to acquire (or release, with `kind = None`) an advisory lock
/// on the single-byte range `[offset, offset+1)` of `file`.
fn fcntl_lock(file: &File, offset: i64, kind: Option<LockKind>, blocking: bool) -> DbResult<bool> {
    let l_type = match kind {
        None => libc::F_UNLCK,
        Some(LockKind::Shared) => libc::F_RDLCK,
        Some(LockKind::Exclusive) => libc::F_WRLCK,
    };

    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = l_type as _;
    flock.l_whence = libc::SEEK_SET as _;
    flock.l_start = offset as _;
    flock.l_len = 1;

    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            let (set, setw) = (libc::F_OFD_SETLK, libc::F_OFD_SETLKW);
        } else {
            let (set, setw) = (libc::F_SETLK, libc::F_SETLKW);
        }
    }

    let cmd = if blocking { setw } else { set };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &flock) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if !blocking
        && matches!(
            err.raw_os_error(),
            Some(libc::EACCES) | Some(libc::EAGAIN)
        )
    {
        return Ok(false);
    }
    Err(CoreError::Io(err))
}

/// A held advisory lock over one of the named byte ranges. Releases the
/// range automatically on drop.
#[derive(Debug)]
pub struct RangeLock<'f> {
    file: &'f File,
    offset: i64,
}

impl<'f> RangeLock<'f> {
    pub fn acquire(file: &'f File, offset: i64, kind: LockKind) -> DbResult<Self> {
        fcntl_lock(file, offset, Some(kind), true)?;
        Ok(Self { file, offset })
    }

    pub fn try_acquire(file: &'f File, offset: i64, kind: LockKind) -> DbResult<Option<Self>> {
        if fcntl_lock(file, offset, Some(kind), false)? {
            Ok(Some(Self { file, offset }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.file, self.offset, None, false);
    }
}
