//! Streaming decoder for `LIST` responses.
//!
//! A listing is a sequence of `DENT` records terminated by a single `DONE` record. There is no
//! record count up front, so the only way to know the listing is over is to read the terminator.

use std::fmt;
use std::iter::FusedIterator;

use thiserror::Error;
use tracing::debug;

use super::{DirEntry, SyncScanner, TransportError};

const ID_LEN: usize = 4;
const ID_DENT: &str = "DENT";
const ID_DONE: &str = "DONE";

/// The part of a record that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryField {
    /// The 4-byte record id.
    Id,
    /// The file mode.
    Mode,
    /// The file size.
    Size,
    /// The modification time.
    ModifiedAt,
    /// The file name.
    Name,
}

impl fmt::Display for EntryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Id => "entry id",
            Self::Mode => "file mode",
            Self::Size => "file size",
            Self::ModifiedAt => "file time",
            Self::Name => "file name",
        })
    }
}

/// Failure to decode a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A record started with an id other than `DENT` or `DONE`.
    #[error("error reading dir entries: expected dir entry ID 'DENT', but got '{0}'")]
    UnexpectedEntryId(String),

    /// The transport failed while reading one of the record's fields.
    #[error("error reading dir entries: error reading {field}")]
    Field {
        /// Which field was being read.
        field: EntryField,
        /// The transport failure.
        #[source]
        source: TransportError,
    },
}

impl DecodeError {
    /// The transport error behind this failure, if any.
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::UnexpectedEntryId(_) => None,
            Self::Field { source, .. } => Some(source),
        }
    }
}

trait FieldContext<T> {
    fn field(self, field: EntryField) -> Result<T, DecodeError>;
}

impl<T> FieldContext<T> for Result<T, TransportError> {
    fn field(self, field: EntryField) -> Result<T, DecodeError> {
        self.map_err(|source| DecodeError::Field { field, source })
    }
}

/// Lazily decodes the entries of one directory listing.
///
/// Yields `Ok(entry)` for every `DENT` record. The iterator ends after the `DONE` record, or
/// after yielding a single `Err`. Either way the scanner is closed exactly once, and further calls
/// to [`next`](Iterator::next) return `None` without touching it. Dropping the iterator early
/// closes the scanner too.
pub struct DirEntries<S: SyncScanner> {
    scanner: S,
    finished: bool,
    closed: bool,
}

impl<S: SyncScanner> DirEntries<S> {
    /// Start decoding the listing that `scanner` is positioned at.
    pub fn new(scanner: S) -> Self {
        Self {
            scanner,
            finished: false,
            closed: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.close_scanner();
    }

    fn close_scanner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.scanner.close() {
            debug!(error = %e, "failed to close listing stream");
        }
    }

    /// Reads one record. `Ok(None)` means the terminator was read.
    fn read_record(&mut self) -> Result<Option<DirEntry>, DecodeError> {
        let id = self
            .scanner
            .read_fixed_string(ID_LEN)
            .field(EntryField::Id)?;
        match id.as_str() {
            ID_DONE => return Ok(None),
            ID_DENT => {}
            _ => return Err(DecodeError::UnexpectedEntryId(id)),
        }

        let mode = self.scanner.read_file_mode().field(EntryField::Mode)?;
        let size = self.scanner.read_i32().field(EntryField::Size)?;
        let modified_at = self.scanner.read_time().field(EntryField::ModifiedAt)?;
        let name = self.scanner.read_string().field(EntryField::Name)?;

        Ok(Some(DirEntry {
            name,
            mode,
            size,
            modified_at,
        }))
    }
}

impl<S: SyncScanner> Iterator for DirEntries<S> {
    type Item = Result<DirEntry, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_record() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

impl<S: SyncScanner> FusedIterator for DirEntries<S> {}

impl<S: SyncScanner> Drop for DirEntries<S> {
    fn drop(&mut self) {
        self.close_scanner();
    }
}
