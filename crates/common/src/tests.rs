use crate::*;

#[test]
fn interval_basic() {
    let iv = Interval::new(4, 9);
    assert_eq!(iv.length(), 5);
    assert!(!iv.is_empty());
    assert_eq!(Interval::single(4).length(), 1);
    assert!(Interval::new(4, 4).is_empty());
}

#[test]
fn interval_sequence_merges_adjacent() {
    let mut seq = IntervalSequence::new();
    seq.push_back(Interval::new(0, 4));
    seq.push_back(Interval::new(4, 10));
    assert_eq!(seq.len(), 1);
    assert_eq!(seq.front().unwrap(), Interval::new(0, 10));
    assert_eq!(seq.total_length(), 10);
}

#[test]
fn interval_sequence_does_not_merge_gaps() {
    let mut seq = IntervalSequence::new();
    seq.push_back(Interval::new(0, 4));
    seq.push_back(Interval::new(10, 12));
    assert_eq!(seq.len(), 2);
    assert_eq!(seq.total_length(), 6);
}

#[test]
fn pop_front_n_splits_head_interval() {
    let mut seq = IntervalSequence::new();
    seq.push_back(Interval::new(0, 10));
    let taken = seq.pop_front_n(3).unwrap();
    assert_eq!(taken, Interval::new(0, 3));
    assert_eq!(seq.front().unwrap(), Interval::new(3, 10));
    assert_eq!(seq.total_length(), 7);

    let taken = seq.pop_front_n(100).unwrap();
    assert_eq!(taken, Interval::new(3, 10));
    assert!(seq.is_empty());
}

#[test]
fn sort_coalesces_out_of_order_intervals() {
    let mut seq = IntervalSequence::new();
    seq.push_back(Interval::new(10, 12));
    seq.push_back(Interval::new(0, 4));
    seq.push_back(Interval::new(4, 10));
    assert_eq!(seq.len(), 2);
    seq.sort();
    assert_eq!(seq.len(), 1);
    assert_eq!(seq.front().unwrap(), Interval::new(0, 12));
}

#[test]
fn move_to_preserves_total_and_merges() {
    let mut a = IntervalSequence::new();
    a.push_back(Interval::new(0, 4));
    let mut b = IntervalSequence::new();
    b.push_back(Interval::new(4, 8));
    a.move_to(&mut b);
    assert!(a.is_empty());
    assert_eq!(b.total_length(), 8);
    assert_eq!(b.front().unwrap(), Interval::new(0, 8));
}

#[test]
fn checksum_round_trip() {
    let mut page = [0u8; PAGE_SIZE];
    page[0] = 42;
    page[100] = 7;
    seal_page(&mut page);
    assert!(verify_page(&page));
    page[50] ^= 0xFF;
    assert!(!verify_page(&page));
}

#[test]
fn config_defaults_match_spec() {
    let cfg = EngineConfig::builder().build();
    assert_eq!(cfg.max_cached_pages, 256);
    assert_eq!(cfg.file_table_flush_watermark, 250_000);
    assert!(cfg.fsync_on_commit);
}
