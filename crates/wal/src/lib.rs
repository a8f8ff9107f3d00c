//! Append-only log manager.
//!
//! The log is a single file of length-prefixed records. A record's LSN is
//! the byte offset of its length prefix, so LSNs are monotonic and the
//! durable horizon is a plain byte offset. Payloads are opaque here;
//! record taxonomy belongs to the layers that own recovery.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, mpsc};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Log sequence number: byte offset of a record in the log file.
pub type Lsn = u64;

const DEFAULT_LOG_BUFFER_SIZE: usize = 1024 * 1024;
const RECORD_HEADER_SIZE: usize = 4;

/// Errors returned by the log manager.
#[derive(Debug, Error)]
pub enum WalError {
    /// Log file I/O failed.
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    /// The on-disk log is malformed.
    #[error("wal corruption: {0}")]
    Corrupt(String),
    /// A previous background flush failed; the log is poisoned.
    #[error("wal writer failed: {0}")]
    WriterFailed(String),
    /// The background writer is gone.
    #[error("wal channel closed")]
    ChannelClosed,
}

/// Convenience alias for log manager results.
pub type WalResult<T> = Result<T, WalError>;

/// Group-committing append-only log.
///
/// Appends land in an in-memory buffer; `flush` rotates the buffer to a
/// background writer thread and blocks until the requested horizon is
/// durable. Clones share the same log state.
#[derive(Clone)]
pub struct LogManager {
    state: Arc<Mutex<LogState>>,
    condvar: Arc<Condvar>,
    sender: mpsc::Sender<FlushRequest>,
}

struct FlushRequest {
    start_lsn: Lsn,
    end_lsn: Lsn,
    bytes: Vec<u8>,
}

struct LogState {
    active: Vec<u8>,
    flushing: Vec<u8>,
    active_start_lsn: Lsn,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
    flushing_in_progress: bool,
    buffer_size: usize,
    last_error: Option<String>,
}

impl LogState {
    fn ensure_ok(&self) -> WalResult<()> {
        match &self.last_error {
            Some(message) => Err(WalError::WriterFailed(message.clone())),
            None => Ok(()),
        }
    }
}

impl LogManager {
    /// Opens (or creates) the log at `path` with the default buffer size.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        Self::open_with_buffer(path, DEFAULT_LOG_BUFFER_SIZE)
    }

    /// Opens the log with an explicit in-memory buffer size.
    pub fn open_with_buffer(path: impl AsRef<Path>, buffer_size: usize) -> WalResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        let state = Arc::new(Mutex::new(LogState {
            active: Vec::with_capacity(buffer_size),
            flushing: Vec::with_capacity(buffer_size),
            active_start_lsn: len,
            next_lsn: len,
            flushed_lsn: len,
            flushing_in_progress: false,
            buffer_size,
            last_error: None,
        }));
        let condvar = Arc::new(Condvar::new());
        let (sender, receiver) = mpsc::channel::<FlushRequest>();
        let writer_state = Arc::clone(&state);
        let writer_condvar = Arc::clone(&condvar);
        std::thread::spawn(move || {
            for request in receiver {
                let result = write_flush_request(&mut file, &request);
                let mut state = writer_state.lock();
                match result {
                    Ok(()) => state.flushed_lsn = state.flushed_lsn.max(request.end_lsn),
                    Err(error) => state.last_error = Some(error.to_string()),
                }
                state.flushing.clear();
                state.flushing_in_progress = false;
                writer_condvar.notify_all();
            }
        });
        Ok(Self {
            state,
            condvar,
            sender,
        })
    }

    /// Appends one record, returning its LSN. The record is buffered, not
    /// yet durable; call `flush` with the returned LSN to make it so.
    pub fn append(&self, payload: &[u8]) -> WalResult<Lsn> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        let record_len = RECORD_HEADER_SIZE + payload.len();
        if state.active.len() + record_len > state.buffer_size {
            self.rotate_active_locked(&mut state)?;
        }
        let lsn = state.next_lsn;
        state
            .active
            .extend_from_slice(&(record_len as u32).to_le_bytes());
        state.active.extend_from_slice(payload);
        state.next_lsn += record_len as u64;
        Ok(lsn)
    }

    /// Blocks until the record starting at `lsn`, and everything before
    /// it, is durable.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        if state.active.is_empty() && !state.flushing_in_progress {
            return Ok(());
        }
        // Flushes land on record boundaries, so the record starting at
        // `target` is durable once the horizon has moved past it.
        let target = lsn.min(state.next_lsn.saturating_sub(1));
        if state.flushed_lsn > target {
            return Ok(());
        }
        if target >= state.active_start_lsn {
            self.rotate_active_locked(&mut state)?;
        }
        while state.flushed_lsn <= target {
            self.condvar.wait(&mut state);
            state.ensure_ok()?;
        }
        Ok(())
    }

    /// Returns the durable horizon.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    /// Hands the active buffer to the writer thread. Waits out any flush
    /// already in progress so the two buffers stay a strict pipeline.
    fn rotate_active_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LogState>,
    ) -> WalResult<()> {
        if state.active.is_empty() {
            return Ok(());
        }
        while state.flushing_in_progress {
            self.condvar.wait(state);
            state.ensure_ok()?;
        }
        let start_lsn = state.active_start_lsn;
        let mut rotated = std::mem::take(&mut state.active);
        std::mem::swap(&mut rotated, &mut state.flushing);
        rotated.clear();
        state.active = rotated;
        let end_lsn = start_lsn + state.flushing.len() as u64;
        state.active_start_lsn = end_lsn;
        state.flushing_in_progress = true;
        let bytes = state.flushing.clone();
        self.sender
            .send(FlushRequest {
                start_lsn,
                end_lsn,
                bytes,
            })
            .map_err(|_| WalError::ChannelClosed)?;
        Ok(())
    }
}

fn write_flush_request(file: &mut File, request: &FlushRequest) -> WalResult<()> {
    file.seek(SeekFrom::Start(request.start_lsn))?;
    file.write_all(&request.bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Sequential reader over the records of a log file.
pub struct LogReader {
    file: File,
    offset: u64,
}

impl LogReader {
    /// Opens the log at `path` for reading from the start.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, offset: 0 })
    }

    /// Positions the reader at a record boundary.
    pub fn seek(&mut self, lsn: Lsn) -> WalResult<()> {
        self.offset = lsn;
        self.file.seek(SeekFrom::Start(lsn))?;
        Ok(())
    }

    /// Returns the next record's payload, or `None` at end of log.
    pub fn next_record(&mut self) -> WalResult<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; RECORD_HEADER_SIZE];
        let bytes_read = self.file.read(&mut len_bytes)?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read < RECORD_HEADER_SIZE {
            return Err(WalError::Corrupt("record length truncated".to_string()));
        }
        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len < RECORD_HEADER_SIZE {
            return Err(WalError::Corrupt(format!(
                "invalid record length {}",
                record_len
            )));
        }
        let mut payload = vec![0u8; record_len - RECORD_HEADER_SIZE];
        self.file.read_exact(&mut payload)?;
        self.offset += record_len as u64;
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("test.wal")
    }

    #[test]
    fn append_flush_read_back() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::open(log_path(&dir)).unwrap();

        let first = manager.append(b"alpha").unwrap();
        let second = manager.append(b"beta").unwrap();
        assert_eq!(first, 0);
        assert!(second > first);

        manager.flush(second).unwrap();
        assert!(manager.flushed_lsn() >= second);

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"alpha");
        assert_eq!(reader.next_record().unwrap().unwrap(), b"beta");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn flush_of_durable_lsn_is_immediate() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::open(log_path(&dir)).unwrap();
        let lsn = manager.append(b"only").unwrap();
        manager.flush(lsn).unwrap();
        // Already durable; must not block or error.
        manager.flush(lsn).unwrap();
        manager.flush(0).unwrap();
    }

    #[test]
    fn small_buffer_rotates_on_append() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::open_with_buffer(log_path(&dir), 16).unwrap();

        let mut last = 0;
        for i in 0u8..8 {
            last = manager.append(&[i; 8]).unwrap();
        }
        manager.flush(last).unwrap();

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        let mut count = 0u8;
        while let Some(payload) = reader.next_record().unwrap() {
            assert_eq!(payload, vec![count; 8]);
            count += 1;
        }
        assert_eq!(count, 8);
    }

    #[test]
    fn reopen_continues_at_end() {
        let dir = TempDir::new().unwrap();
        {
            let manager = LogManager::open(log_path(&dir)).unwrap();
            let lsn = manager.append(b"before").unwrap();
            manager.flush(lsn).unwrap();
        }

        let manager = LogManager::open(log_path(&dir)).unwrap();
        let lsn = manager.append(b"after").unwrap();
        assert!(lsn > 0);
        manager.flush(lsn).unwrap();

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"before");
        assert_eq!(reader.next_record().unwrap().unwrap(), b"after");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn reader_seek_skips_records() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::open(log_path(&dir)).unwrap();
        manager.append(b"skip me").unwrap();
        let target = manager.append(b"read me").unwrap();
        manager.flush(target).unwrap();

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        reader.seek(target).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap(), b"read me");
        assert!(reader.next_record().unwrap().is_none());
    }
}
