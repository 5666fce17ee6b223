use crate::*;
use common::Interval;

#[test]
fn posix_host_file_round_trips_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = PosixHostFile::open(dir.path().join("db.cfs")).unwrap();

    let iv = f.new_interval(3).unwrap();
    assert_eq!(iv, Interval::new(0, 3));
    assert_eq!(f.file_size_in_pages().unwrap(), 3);

    let mut page = [7u8; PAGE_SIZE];
    page[PAGE_SIZE - 1] = 9;
    f.write_page_full(1, &page).unwrap();
    f.flush().unwrap();

    let read_back = f.read_page_full(1).unwrap();
    assert_eq!(read_back, page);
}

#[test]
fn posix_host_file_truncate_shrinks() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = PosixHostFile::open(dir.path().join("db.cfs")).unwrap();
    f.new_interval(5).unwrap();
    f.truncate(2).unwrap();
    assert_eq!(f.file_size_in_pages().unwrap(), 2);
}

#[test]
fn mem_host_file_matches_posix_semantics() {
    let mut f = MemHostFile::new();
    let iv = f.new_interval(2).unwrap();
    let page = [1u8; PAGE_SIZE];
    f.write_pages(iv, &[page, page].concat()).unwrap();
    let mut dst = vec![0u8; PAGE_SIZE * 2];
    f.read_pages(iv, &mut dst).unwrap();
    assert_eq!(dst, [page, page].concat());
}

#[test]
fn mem_host_file_injects_failure() {
    let mut f = MemHostFile::new();
    f.fail_after(1);
    assert!(f.new_interval(1).is_ok());
    assert!(f.new_interval(1).is_err());
}

#[test]
fn copy_page_duplicates_contents() {
    let mut f = MemHostFile::new();
    f.new_interval(2).unwrap();
    let mut page = [0u8; PAGE_SIZE];
    page[10] = 99;
    f.write_page_full(0, &page).unwrap();
    f.copy_page(0, 1).unwrap();
    assert_eq!(f.read_page_full(1).unwrap(), page);
}
