use crate::*;
use std::fs::OpenOptions;

fn open_twice(path: &std::path::Path) -> (File, File) {
    let a = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap();
    let b = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    (a, b)
}

#[test]
fn two_readers_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);
    let pb = LockProtocol::new(&fb);

    let _ra = pa.read_access().unwrap();
    let _rb = pb.read_access().unwrap();
}

#[test]
fn second_writer_is_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);
    let pb = LockProtocol::new(&fb);

    let _wa = pa.write_access().unwrap();
    assert!(pb.try_write_access().unwrap().is_none());
}

#[test]
fn writer_does_not_block_readers_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);
    let pb = LockProtocol::new(&fb);

    let _wa = pa.write_access().unwrap();
    // readers are unaffected by a plain write lock
    let _rb = pb.read_access().unwrap();
}

#[test]
fn commit_access_excluded_by_active_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);
    let pb = LockProtocol::new(&fb);

    let wa = pa.write_access().unwrap();
    let _rb = pb.read_access().unwrap();

    // a reader is active, so the non-blocking upgrade must fail and hand
    // the write lock back
    match pa.try_commit_access(wa).unwrap() {
        Ok(_) => panic!("commit access should not have been granted"),
        Err(_write_lock) => {}
    }
}

#[test]
fn commit_access_succeeds_with_no_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, _fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);

    let wa = pa.write_access().unwrap();
    let commit = pa.commit_access(wa).unwrap();
    let _wa_again = commit.release();
}

#[test]
fn commit_access_blocks_new_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.cfs");
    let (fa, fb) = open_twice(&path);
    let pa = LockProtocol::new(&fa);
    let pb = LockProtocol::new(&fb);

    let wa = pa.write_access().unwrap();
    let commit = pa.commit_access(wa).unwrap();

    // gate-X is held, so a new reader cannot even begin admission
    assert!(pb.try_read_access().unwrap().is_none());

    let _wa_again = commit.release();
    // after release, readers are admitted again
    assert!(pb.try_read_access().unwrap().is_some());
}
