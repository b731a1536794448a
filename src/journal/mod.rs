//! The append-only journal backing a queue.
//!
//! One journal file exists per queue, at `<persistence_path>/<name>`. Every
//! queue mutation appends a record before the in-memory state changes, so
//! replaying the file from the start reconstructs the logical queue after a
//! crash. The journal also powers read-behind: when the queue outgrows its
//! memory budget, a read cursor trails the append position and streams items
//! back into memory as the head drains.
//!
//! The writer, the read-behind cursor, and the replay scanner are three
//! independent handles onto the same file. The owning queue serializes all
//! of them under its lock, so none of the handles ever race each other.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use snafu::{ResultExt, Snafu};

use crate::item::{now_millis, Item};

pub mod record;

pub use self::record::{DecodeError, Record};

/// Error that occurred during calls to [`Journal`].
#[derive(Debug, Snafu)]
pub enum JournalError {
    /// A general I/O error occurred.
    ///
    /// Any append or rotation failure is fatal for the owning queue: once
    /// the file and memory can disagree, continuing to serve operations
    /// would silently break crash recovery.
    #[snafu(display("journal I/O error: {source}"))]
    Io { source: io::Error },

    /// The journal was closed and cannot accept appends.
    #[snafu(display("journal is closed"))]
    Closed,

    /// A record in the body of the journal could not be decoded.
    ///
    /// Decode failures at the *tail* of the file are tolerated during
    /// replay (a crash mid-append leaves exactly that shape); this variant
    /// covers corruption found while streaming items back during
    /// read-behind, where every record was previously written whole.
    #[snafu(display("corrupt journal record: {source}"))]
    Corrupt { source: DecodeError },
}

/// The append-only journal of a single queue.
pub struct Journal {
    path: PathBuf,
    writer: Option<File>,
    /// Append position; equals the file length.
    size: u64,
    /// Read-behind cursor, present only while the cursor trails the write
    /// end.
    read_handle: Option<BufReader<File>>,
    read_pos: u64,
    /// Replay scanner, present only during `replay`.
    replay_handle: Option<BufReader<File>>,
    replay_pos: u64,
    scratch: BytesMut,
}

impl Journal {
    /// Opens the journal file at `path`, creating it (and any missing parent
    /// directories) if it does not yet exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the file cannot be created or
    /// opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Journal, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(IoSnafu)?;
        }
        let writer = open_append(&path)?;
        let size = writer.metadata().context(IoSnafu)?.len();

        Ok(Journal {
            path,
            writer: Some(writer),
            size,
            read_handle: None,
            read_pos: 0,
            replay_handle: None,
            replay_pos: 0,
            scratch: BytesMut::new(),
        })
    }

    /// Gets the path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the current length of the journal file, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a record, optionally forcing it to disk before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed or the write (or fsync)
    /// fails. Either failure is fatal for the owning queue.
    pub fn append(&mut self, record: &Record, fsync: bool) -> Result<(), JournalError> {
        let writer = self.writer.as_mut().ok_or(JournalError::Closed)?;

        self.scratch.clear();
        record.encode(&mut self.scratch);
        writer.write_all(&self.scratch).context(IoSnafu)?;
        self.size += self.scratch.len() as u64;

        if fsync {
            writer.sync_all().context(IoSnafu)?;
        }
        Ok(())
    }

    /// Atomically rewrites the journal so it reflects only current queue
    /// state: the transaction counter, the open transactions (each an add
    /// immediately re-marked tentatively removed), and the live items.
    ///
    /// The replacement is staged in a sibling temp file, fsynced, and
    /// renamed over the primary, so a crash at any point leaves one intact
    /// journal on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if staging, renaming, or reopening fails; fatal for
    /// the owning queue.
    #[instrument(skip_all, level = "debug")]
    pub fn roll(
        &mut self,
        xid: u32,
        open_items: &[&Item],
        live_items: &[&Item],
    ) -> Result<(), JournalError> {
        debug_assert!(self.read_handle.is_none(), "cannot roll in read-behind");

        self.scratch.clear();
        Record::SavedXid { xid }.encode(&mut self.scratch);
        for item in open_items {
            Record::AddX {
                expiry: item.expiry,
                data: item.data.clone(),
            }
            .encode(&mut self.scratch);
            Record::RemoveTentativeX { xid: item.xid }.encode(&mut self.scratch);
        }
        for item in live_items {
            Record::AddX {
                expiry: item.expiry,
                data: item.data.clone(),
            }
            .encode(&mut self.scratch);
        }

        let temp_path = sibling_temp_path(&self.path);
        let mut staged = File::create(&temp_path).context(IoSnafu)?;
        staged.write_all(&self.scratch).context(IoSnafu)?;
        staged.sync_all().context(IoSnafu)?;
        drop(staged);

        self.writer = None;
        fs::rename(&temp_path, &self.path).context(IoSnafu)?;
        self.writer = Some(open_append(&self.path)?);
        let rolled_size = self.scratch.len() as u64;
        debug!(
            path = %self.path.display(),
            previous_size = self.size,
            rolled_size,
            "Rolled journal."
        );
        self.size = rolled_size;

        Ok(())
    }

    /// Deletes the journal file and starts a fresh, empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be deleted or recreated.
    pub fn erase(&mut self) -> Result<(), JournalError> {
        self.writer = None;
        self.read_handle = None;
        self.replay_handle = None;
        self.read_pos = 0;
        self.replay_pos = 0;

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(JournalError::Io { source }),
        }
        self.writer = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }

    /// Closes the journal. Subsequent appends fail.
    pub fn close(&mut self) {
        self.writer = None;
        self.read_handle = None;
        self.replay_handle = None;
    }

    /// Returns `true` while a replay is in progress.
    pub fn is_replaying(&self) -> bool {
        self.replay_handle.is_some()
    }

    /// Begins replaying the journal from the start of the file.
    ///
    /// Records are pulled one at a time with [`Journal::replay_next`] and
    /// the scan is finalized with [`Journal::finish_replay`]. The journal
    /// must not be appended to in between.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for reading.
    pub fn begin_replay(&mut self) -> Result<(), JournalError> {
        let file = File::open(&self.path).context(IoSnafu)?;
        self.replay_handle = Some(BufReader::new(file));
        self.replay_pos = 0;
        Ok(())
    }

    /// Decodes the next record of an in-progress replay.
    ///
    /// Returns `Ok(None)` at a clean end of file.
    ///
    /// # Errors
    ///
    /// Propagates decode errors to the caller, which decides whether the
    /// failure is a tolerable truncated tail or real corruption; either
    /// way, [`Journal::finish_replay`] discards everything past the last
    /// successfully decoded record.
    pub fn replay_next(&mut self) -> Result<Option<Record>, DecodeError> {
        let Some(reader) = self.replay_handle.as_mut() else {
            return Ok(None);
        };
        match record::read_record(reader)? {
            Some(decoded) => {
                self.replay_pos += decoded.encoded_len() as u64;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Gets the byte position of an in-progress replay: the end of the last
    /// successfully decoded record.
    pub fn replay_position(&self) -> u64 {
        self.replay_pos
    }

    /// Ends a replay: any partial or undecodable tail is truncated away,
    /// and the journal is reopened for append at the observed end.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation or metadata probe fails.
    pub fn finish_replay(&mut self) -> Result<(), JournalError> {
        self.replay_handle = None;

        let actual_len = fs::metadata(&self.path).context(IoSnafu)?.len();
        if actual_len > self.replay_pos {
            warn!(
                path = %self.path.display(),
                discarded = actual_len - self.replay_pos,
                "Truncating journal past the last whole record."
            );
            let writer = self.writer.as_ref().ok_or(JournalError::Closed)?;
            writer.set_len(self.replay_pos).context(IoSnafu)?;
            writer.sync_all().context(IoSnafu)?;
        }
        self.size = self.replay_pos;
        Ok(())
    }

    /// Returns `true` while the read-behind cursor trails the write end.
    pub fn in_read_behind(&self) -> bool {
        self.read_handle.is_some()
    }

    /// Enters read-behind: records a read cursor at the current write (or
    /// replay) position. Items appended past this point stay on disk until
    /// [`Journal::fill_read_behind`] streams them back in.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for reading.
    pub fn start_read_behind(&mut self) -> Result<(), JournalError> {
        if self.read_handle.is_some() {
            return Ok(());
        }
        let position = if self.replay_handle.is_some() {
            self.replay_pos
        } else {
            self.size
        };
        let mut file = File::open(&self.path).context(IoSnafu)?;
        file.seek(SeekFrom::Start(position)).context(IoSnafu)?;
        self.read_handle = Some(BufReader::new(file));
        self.read_pos = position;
        debug!(path = %self.path.display(), position, "Entering read-behind.");
        Ok(())
    }

    /// Advances the read cursor to the next add record and materializes its
    /// item, skipping over non-add records.
    ///
    /// Returns `Ok(None)` once the cursor reaches the write end, which ends
    /// read-behind.
    ///
    /// # Errors
    ///
    /// Returns an error if a record between the cursor and the write end
    /// cannot be decoded; every record in that region was written whole, so
    /// this is corruption and fatal for the owning queue.
    pub fn fill_read_behind(&mut self) -> Result<Option<Item>, JournalError> {
        // During replay the authoritative end is the replay scanner, not the
        // file length: the tail past it may be truncated garbage.
        let end = if self.replay_handle.is_some() {
            self.replay_pos
        } else {
            self.size
        };

        loop {
            let Some(reader) = self.read_handle.as_mut() else {
                return Ok(None);
            };
            if self.read_pos >= end {
                self.read_handle = None;
                debug!(path = %self.path.display(), "Read-behind caught up with the write end.");
                return Ok(None);
            }

            match record::read_record(reader) {
                Ok(Some(decoded)) => {
                    self.read_pos += decoded.encoded_len() as u64;
                    if self.read_pos >= end {
                        // The cursor no longer trails the write end, so
                        // read-behind is over as soon as this record is
                        // handled.
                        self.read_handle = None;
                        debug!(
                            path = %self.path.display(),
                            "Read-behind caught up with the write end."
                        );
                    }
                    match decoded {
                        Record::Add { data } => {
                            return Ok(Some(Item::new(now_millis(), 0, data)));
                        }
                        Record::AddX { expiry, data } => {
                            return Ok(Some(Item::new(now_millis(), expiry, data)));
                        }
                        // Removes, confirms, and counter snapshots do not
                        // produce items.
                        _ => {}
                    }
                }
                Ok(None) => return Err(JournalError::Corrupt {
                    source: DecodeError::Truncated,
                }),
                Err(source) => return Err(JournalError::Corrupt { source }),
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File, JournalError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(IoSnafu)
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".rolling");
    PathBuf::from(name)
}
