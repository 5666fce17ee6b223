//! Inter-process lock protocol: three named byte-range locks over the host
//! file coordinate many readers with a single writer and a brief exclusive
//! commit window. Corresponds to spec §4.5.
//!
//! Grounded on `original_source/CompoundFs/LockProtocol.h` and
//! `FileLockPosition.h`. Where the original used a runtime "is this the
//! same mutex" check before allowing a write lock to be upgraded to a
//! commit lock, this crate encodes that invariant as a typestate
//! (`WriteLock` -> `CommitLock` is the only path to a commit), which is the
//! more idiomatic Rust shape for the same guarantee.

#[cfg(test)]
mod tests;

mod range;

use common::DbResult;
use range::{LockKind, RangeLock};
use std::fs::File;

/// The gate range: readers take this briefly (shared) to synchronize with
/// an in-progress commit; a committing writer holds it exclusively for the
/// whole commit window to block new readers.
pub const GATE_OFFSET: i64 = i64::MAX - 3;
/// The shared range: held for the lifetime of a read transaction; taken
/// exclusively by a committing writer once all active readers have
/// drained.
pub const SHARED_OFFSET: i64 = i64::MAX - 2;
/// The writer range: held exclusively for the lifetime of a write
/// transaction.
pub const WRITER_OFFSET: i64 = i64::MAX - 1;

/// Held while a reader transaction is open. Pins nothing but the `shared`
/// range; many `ReadLock`s may coexist.
#[derive(Debug)]
pub struct ReadLock<'f>(#[allow(dead_code)] RangeLock<'f>);

/// Held while a writer transaction is open but not yet committing. At most
/// one `WriteLock` can exist at a time.
#[derive(Debug)]
pub struct WriteLock<'f>(RangeLock<'f>);

/// Held during the brief window where dirty pages are published. No reader
/// can observe the file while a `CommitLock` is alive.
#[derive(Debug)]
pub struct CommitLock<'f> {
    writer: RangeLock<'f>,
    gate: RangeLock<'f>,
    shared: RangeLock<'f>,
}

impl<'f> CommitLock<'f> {
    /// Ends the commit window, downgrading back to a plain `WriteLock` for
    /// the remainder of the transaction (or until the caller drops it).
    pub fn release(self) -> WriteLock<'f> {
        tracing::debug!("leaving commit window: downgrading commit lock to write lock");
        drop(self.shared);
        drop(self.gate);
        WriteLock(self.writer)
    }
}

/// Drives the gate/shared/writer protocol over a single host file.
#[derive(Debug)]
pub struct LockProtocol<'f> {
    file: &'f File,
}

impl<'f> LockProtocol<'f> {
    pub fn new(file: &'f File) -> Self {
        Self { file }
    }

    /// Reader admission: briefly take `gate-S` (to wait out any in-progress
    /// commit), then take `shared-S` for the duration of the read
    /// transaction.
    pub fn read_access(&self) -> DbResult<ReadLock<'f>> {
        let _gate = RangeLock::acquire(self.file, GATE_OFFSET, LockKind::Shared)?;
        let shared = RangeLock::acquire(self.file, SHARED_OFFSET, LockKind::Shared)?;
        Ok(ReadLock(shared))
    }

    pub fn try_read_access(&self) -> DbResult<Option<ReadLock<'f>>> {
        let Some(_gate) = RangeLock::try_acquire(self.file, GATE_OFFSET, LockKind::Shared)? else {
            return Ok(None);
        };
        let Some(shared) = RangeLock::try_acquire(self.file, SHARED_OFFSET, LockKind::Shared)?
        else {
            return Ok(None);
        };
        Ok(Some(ReadLock(shared)))
    }

    /// Writer admission: take `writer-X`. Runs concurrently with any number
    /// of readers.
    pub fn write_access(&self) -> DbResult<WriteLock<'f>> {
        let writer = RangeLock::acquire(self.file, WRITER_OFFSET, LockKind::Exclusive)?;
        Ok(WriteLock(writer))
    }

    pub fn try_write_access(&self) -> DbResult<Option<WriteLock<'f>>> {
        let Some(writer) = RangeLock::try_acquire(self.file, WRITER_OFFSET, LockKind::Exclusive)?
        else {
            return Ok(None);
        };
        Ok(Some(WriteLock(writer)))
    }

    /// Upgrades a held `WriteLock` to a `CommitLock`: take `gate-X` (blocks
    /// new readers) then `shared-X` (bounded wait for active readers to
    /// drain — bounded because `gate-X` is already held, so no new reader
    /// can join the queue ahead of us).
    pub fn commit_access(&self, write_lock: WriteLock<'f>) -> DbResult<CommitLock<'f>> {
        tracing::debug!("entering commit window: upgrading write lock to commit lock");
        let gate = RangeLock::acquire(self.file, GATE_OFFSET, LockKind::Exclusive)?;
        let shared = RangeLock::acquire(self.file, SHARED_OFFSET, LockKind::Exclusive)?;
        Ok(CommitLock {
            writer: write_lock.0,
            gate,
            shared,
        })
    }

    /// Non-blocking form of `commit_access`. Returns the `WriteLock` back
    /// to the caller if the upgrade could not be completed immediately.
    pub fn try_commit_access(
        &self,
        write_lock: WriteLock<'f>,
    ) -> DbResult<Result<CommitLock<'f>, WriteLock<'f>>> {
        let Some(gate) = RangeLock::try_acquire(self.file, GATE_OFFSET, LockKind::Exclusive)?
        else {
            return Ok(Err(write_lock));
        };
        let Some(shared) = RangeLock::try_acquire(self.file, SHARED_OFFSET, LockKind::Exclusive)?
        else {
            return Ok(Err(write_lock));
        };
        Ok(Ok(CommitLock {
            writer: write_lock.0,
            gate,
            shared,
        }))
    }
}
