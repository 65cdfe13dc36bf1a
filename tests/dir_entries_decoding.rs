#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use adb_fs::fs::{FileKind, FileMode};
use adb_fs::wire::{
    DecodeError, DirEntries, EntryField, IoScanner, SyncScanner, TransportError,
    TransportErrorKind,
};

use common::transport_mocks::{encode_dent, encode_done, encode_listing};

/// Wraps an `IoScanner` and counts `close` calls and value reads.
struct CountingScanner {
    inner: IoScanner<Cursor<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl CountingScanner {
    fn new(bytes: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let (scanner, closes, _) = Self::with_read_count(bytes);
        (scanner, closes)
    }

    fn with_read_count(bytes: Vec<u8>) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: IoScanner::new(Cursor::new(bytes)),
                closes: Arc::clone(&closes),
                reads: Arc::clone(&reads),
            },
            closes,
            reads,
        )
    }

    fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

impl SyncScanner for CountingScanner {
    fn read_fixed_string(&mut self, len: usize) -> Result<String, TransportError> {
        self.count_read();
        self.inner.read_fixed_string(len)
    }

    fn read_string(&mut self) -> Result<String, TransportError> {
        self.count_read();
        self.inner.read_string()
    }

    fn read_i32(&mut self) -> Result<i32, TransportError> {
        self.count_read();
        self.inner.read_i32()
    }

    fn read_file_mode(&mut self) -> Result<FileMode, TransportError> {
        self.count_read();
        self.inner.read_file_mode()
    }

    fn read_time(&mut self) -> Result<SystemTime, TransportError> {
        self.count_read();
        self.inner.read_time()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

#[test]
fn well_formed_listing_yields_every_entry_in_order() {
    let bytes = encode_listing(&[("a.txt", 1), ("b.txt", 22), ("c.txt", 333)]);
    let (scanner, closes) = CountingScanner::new(bytes);
    let mut entries = DirEntries::new(scanner);

    let names: Vec<String> = entries
        .by_ref()
        .map(|e| e.unwrap().name)
        .collect();
    assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
    assert!(entries.next().is_none(), "iterator must stay finished");
    assert_eq!(closes.load(Ordering::SeqCst), 1, "closed once at DONE");

    drop(entries);
    assert_eq!(closes.load(Ordering::SeqCst), 1, "drop must not close again");
}

#[test]
fn nothing_after_done_is_read() {
    let mut bytes = encode_listing(&[("only", 7)]);
    // Another record after the terminator must never be touched.
    encode_dent(&mut bytes, 0o100_644, 9, 0, "trailing");
    bytes.extend_from_slice(b"JUNK");
    let (scanner, closes, reads) = CountingScanner::with_read_count(bytes);
    let mut entries = DirEntries::new(scanner);

    assert_eq!(entries.next().unwrap().unwrap().name, "only");
    assert!(entries.next().is_none());
    // One DENT record is an id plus four fields, then the DONE id.
    assert_eq!(reads.load(Ordering::SeqCst), 6);

    for _ in 0..3 {
        assert!(entries.next().is_none());
    }
    assert_eq!(reads.load(Ordering::SeqCst), 6, "no reads past DONE");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn entry_fields_are_decoded() {
    let mut bytes = Vec::new();
    encode_dent(&mut bytes, 0o040_755, 4096, 1_600_000_000, "DCIM");
    encode_dent(&mut bytes, 0o120_777, -1, 0, "sdcard");
    encode_done(&mut bytes);

    let entries: Vec<_> = DirEntries::new(IoScanner::new(Cursor::new(bytes)))
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].mode.kind(), Some(FileKind::Directory));
    assert_eq!(entries[0].size, 4096);
    assert_eq!(
        entries[0].modified_at,
        UNIX_EPOCH + Duration::from_secs(1_600_000_000)
    );
    assert_eq!(entries[1].mode.kind(), Some(FileKind::Symlink));
    assert_eq!(entries[1].size, -1);
}

#[test]
fn empty_listing_ends_immediately() {
    let (scanner, closes) = CountingScanner::new(encode_listing(&[]));
    let mut entries = DirEntries::new(scanner);
    assert!(entries.next().is_none());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn bad_tag_yields_prior_entries_then_one_error() {
    let mut bytes = Vec::new();
    encode_dent(&mut bytes, 0o100_644, 1, 0, "first");
    encode_dent(&mut bytes, 0o100_644, 2, 0, "second");
    bytes.extend_from_slice(b"FAIL");
    encode_dent(&mut bytes, 0o100_644, 3, 0, "never");
    encode_done(&mut bytes);

    let (scanner, closes) = CountingScanner::new(bytes);
    let mut entries = DirEntries::new(scanner);

    assert_eq!(entries.next().unwrap().unwrap().name, "first");
    assert_eq!(entries.next().unwrap().unwrap().name, "second");
    let err = entries.next().unwrap().unwrap_err();
    assert_eq!(err, DecodeError::UnexpectedEntryId("FAIL".to_owned()));
    assert!(entries.next().is_none());
    assert!(entries.next().is_none());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn truncated_record_names_the_missing_field() {
    let mut bytes = Vec::new();
    encode_dent(&mut bytes, 0o100_644, 1, 0, "whole");
    bytes.extend_from_slice(b"DENT");
    bytes.extend_from_slice(&0o100_644_u32.to_le_bytes());
    bytes.extend_from_slice(&[0, 0]);

    let (scanner, closes) = CountingScanner::new(bytes);
    let results: Vec<_> = DirEntries::new(scanner).collect();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(DecodeError::Field { field, source }) => {
            assert_eq!(*field, EntryField::Size);
            assert_eq!(source.kind, TransportErrorKind::ConnectionReset);
        }
        other => panic!("expected a size field error, got {other:?}"),
    }
    assert!(results[1]
        .as_ref()
        .unwrap_err()
        .to_string()
        .contains("file size"));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_name_is_a_name_field_error() {
    let mut bytes = b"DENT".to_vec();
    bytes.extend_from_slice(&0o100_644_u32.to_le_bytes());
    bytes.extend_from_slice(&5_i32.to_le_bytes());
    bytes.extend_from_slice(&0_u32.to_le_bytes());
    bytes.extend_from_slice(&2_u32.to_le_bytes());
    bytes.extend_from_slice(&[0xff, 0xfe]);

    let err = DirEntries::new(IoScanner::new(Cursor::new(bytes)))
        .next()
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Field {
            field: EntryField::Name,
            ..
        }
    ));
    assert_eq!(
        err.transport_error().map(|e| e.kind),
        Some(TransportErrorKind::Parse)
    );
}

#[test]
fn dropping_early_closes_scanner_once() {
    let bytes = encode_listing(&[("a", 1), ("b", 2)]);
    let (scanner, closes) = CountingScanner::new(bytes);
    let mut entries = DirEntries::new(scanner);
    assert!(entries.next().unwrap().is_ok());
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    drop(entries);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
