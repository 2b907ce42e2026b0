//! Byte-addressed devices with partial-completion vectored I/O.
//!
//! A [`ByteDevice`] is the filesystem capability the block store consumes:
//! positional vectored reads and writes that may complete only part of the
//! request (like `preadv`/`pwritev`), a length query, and a durability
//! barrier. Callers that need the whole transfer use the continuation
//! helpers in [`crate::vectored`].
//!
//! - **[`FileByteDevice`]**: a regular file opened read/write/create.
//! - **[`MemByteDevice`]**: an in-memory device with fault injection, used by
//!   tests and benchmarks.

use fbs_error::{FbsError, Result};
use fbs_types::ByteOffset;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Byte-addressed device for positional vectored I/O.
pub trait ByteDevice: Send + Sync {
    /// Current length in bytes.
    fn len_bytes(&self) -> io::Result<u64>;

    /// Read into `bufs` in order, starting at `offset`.
    ///
    /// Returns the number of bytes read, which may be less than the total
    /// requested. `Ok(0)` means end-of-file.
    fn read_vectored_at(&self, offset: ByteOffset, bufs: &mut [&mut [u8]]) -> io::Result<usize>;

    /// Write `bufs` in order, starting at `offset`.
    ///
    /// Returns the number of bytes written, which may be less than the total
    /// requested.
    fn write_vectored_at(&self, offset: ByteOffset, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Flush written data to stable storage.
    fn sync(&self) -> io::Result<()>;
}

/// Largest contiguous staging buffer a multi-segment [`FileByteDevice`] call
/// allocates (1 MiB).
pub const MAX_STAGING_BYTES: usize = 1 << 20;

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Multi-segment requests are staged through one contiguous buffer so every
/// call maps to a single positional syscall. The buffer covers at most
/// [`MAX_STAGING_BYTES`] of the request; longer requests complete partially
/// and the [`crate::vectored`] helpers issue the rest.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    path: PathBuf,
}

impl FileByteDevice {
    /// Open `path` read/write, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| FbsError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_vectored_at(&self, offset: ByteOffset, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
        match bufs {
            [] => Ok(0),
            [single] => self.file.read_at(single, offset.0),
            _ => {
                let total: usize = bufs.iter().map(|buf| buf.len()).sum();
                let mut staging = vec![0_u8; total.min(MAX_STAGING_BYTES)];
                let n = self.file.read_at(&mut staging, offset.0)?;
                let mut copied = 0;
                for buf in bufs.iter_mut() {
                    if copied == n {
                        break;
                    }
                    let take = buf.len().min(n - copied);
                    buf[..take].copy_from_slice(&staging[copied..copied + take]);
                    copied += take;
                }
                Ok(n)
            }
        }
    }

    fn write_vectored_at(&self, offset: ByteOffset, bufs: &[&[u8]]) -> io::Result<usize> {
        match bufs {
            [] => Ok(0),
            [single] => self.file.write_at(single, offset.0),
            _ => {
                let total: usize = bufs.iter().map(|buf| buf.len()).sum();
                let limit = total.min(MAX_STAGING_BYTES);
                let mut staging = Vec::with_capacity(limit);
                for buf in bufs {
                    let room = limit - staging.len();
                    if room == 0 {
                        break;
                    }
                    staging.extend_from_slice(&buf[..buf.len().min(room)]);
                }
                self.file.write_at(&staging, offset.0)
            }
        }
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

// ── In-memory device (for testing) ─────────────────────────────────────────

/// Kind of a recorded device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Sync,
}

/// One device call as seen by [`MemByteDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRecord {
    pub kind: IoKind,
    /// File offset in bytes (0 for syncs).
    pub offset: u64,
    /// Bytes requested across all segments.
    pub len: usize,
    /// Number of segments in the request.
    pub segments: usize,
}

/// Device call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Vectored read calls.
    pub reads: u64,
    /// Vectored write calls.
    pub writes: u64,
    /// Sync calls.
    pub syncs: u64,
    /// Total bytes returned by reads.
    pub bytes_read: u64,
    /// Total bytes accepted by writes.
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct MemFaults {
    /// Cap on bytes transferred per call, to exercise continuation paths.
    max_transfer: Option<usize>,
    /// Number of upcoming reads that fail.
    failing_reads: usize,
    /// Writes starting at these byte offsets fail.
    failing_write_offsets: Vec<u64>,
}

#[derive(Debug, Default)]
struct MemInner {
    bytes: Mutex<Vec<u8>>,
    faults: Mutex<MemFaults>,
    log: Mutex<Vec<IoRecord>>,
    stats: Mutex<IoStats>,
    held: Mutex<bool>,
    released: Condvar,
    reads_waiting: AtomicUsize,
    writes_held: Mutex<bool>,
    writes_released: Condvar,
    writes_waiting: AtomicUsize,
}

/// In-memory byte device.
///
/// Clones share the same backing bytes, faults, and log, so a second store
/// can "reopen" what a first one wrote. Reads past the end return short
/// counts; writes past the end grow the buffer with zeros.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    inner: Arc<MemInner>,
}

impl MemByteDevice {
    /// Create an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device pre-filled with `bytes`.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        let dev = Self::default();
        *dev.inner.bytes.lock() = bytes;
        dev
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.bytes.lock().clone()
    }

    /// Transfer at most `max` bytes per call (`None` lifts the cap).
    pub fn set_max_transfer(&self, max: Option<usize>) {
        self.inner.faults.lock().max_transfer = max;
    }

    /// Fail the next `count` read calls.
    pub fn fail_next_reads(&self, count: usize) {
        self.inner.faults.lock().failing_reads = count;
    }

    /// Fail every write call starting at byte `offset` until cleared.
    pub fn fail_writes_at(&self, offset: u64) {
        self.inner.faults.lock().failing_write_offsets.push(offset);
    }

    pub fn clear_write_faults(&self) {
        self.inner.faults.lock().failing_write_offsets.clear();
    }

    /// Block every read call until [`release_reads`](Self::release_reads).
    pub fn hold_reads(&self) {
        *self.inner.held.lock() = true;
    }

    pub fn release_reads(&self) {
        *self.inner.held.lock() = false;
        self.inner.released.notify_all();
    }

    /// Number of read calls currently blocked by [`hold_reads`](Self::hold_reads).
    #[must_use]
    pub fn reads_waiting(&self) -> usize {
        self.inner.reads_waiting.load(Ordering::SeqCst)
    }

    /// Block every write call until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        *self.inner.writes_held.lock() = true;
    }

    pub fn release_writes(&self) {
        *self.inner.writes_held.lock() = false;
        self.inner.writes_released.notify_all();
    }

    /// Number of write calls currently blocked by [`hold_writes`](Self::hold_writes).
    #[must_use]
    pub fn writes_waiting(&self) -> usize {
        self.inner.writes_waiting.load(Ordering::SeqCst)
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn log(&self) -> Vec<IoRecord> {
        self.inner.log.lock().clone()
    }

    /// Recorded calls of one kind.
    #[must_use]
    pub fn calls(&self, kind: IoKind) -> Vec<IoRecord> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|record| record.kind == kind)
            .copied()
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.inner.stats.lock().clone()
    }

    fn record(&self, kind: IoKind, offset: u64, len: usize, segments: usize) {
        self.inner.log.lock().push(IoRecord {
            kind,
            offset,
            len,
            segments,
        });
    }

    fn wait_if_held(&self) {
        let mut held = self.inner.held.lock();
        if !*held {
            return;
        }
        self.inner.reads_waiting.fetch_add(1, Ordering::SeqCst);
        while *held {
            self.inner.released.wait(&mut held);
        }
        self.inner.reads_waiting.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait_if_writes_held(&self) {
        let mut held = self.inner.writes_held.lock();
        if !*held {
            return;
        }
        self.inner.writes_waiting.fetch_add(1, Ordering::SeqCst);
        while *held {
            self.inner.writes_released.wait(&mut held);
        }
        self.inner.writes_waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> io::Result<u64> {
        u64::try_from(self.inner.bytes.lock().len())
            .map_err(|_| io::Error::other("length overflows u64"))
    }

    fn read_vectored_at(&self, offset: ByteOffset, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
        let requested: usize = bufs.iter().map(|buf| buf.len()).sum();
        self.record(IoKind::Read, offset.0, requested, bufs.len());
        self.wait_if_held();

        let max_transfer = {
            let mut faults = self.inner.faults.lock();
            if faults.failing_reads > 0 {
                faults.failing_reads -= 1;
                return Err(io::Error::other("injected read failure"));
            }
            faults.max_transfer
        };

        let start = usize::try_from(offset.0)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let bytes = self.inner.bytes.lock();
        let available = bytes.len().saturating_sub(start);
        let mut budget = requested
            .min(available)
            .min(max_transfer.unwrap_or(usize::MAX));
        let mut pos = start;
        for buf in bufs.iter_mut() {
            if budget == 0 {
                break;
            }
            let take = buf.len().min(budget);
            buf[..take].copy_from_slice(&bytes[pos..pos + take]);
            pos += take;
            budget -= take;
        }
        drop(bytes);

        let n = pos - start;
        let mut stats = self.inner.stats.lock();
        stats.reads += 1;
        stats.bytes_read += n as u64;
        Ok(n)
    }

    fn write_vectored_at(&self, offset: ByteOffset, bufs: &[&[u8]]) -> io::Result<usize> {
        let requested: usize = bufs.iter().map(|buf| buf.len()).sum();
        self.record(IoKind::Write, offset.0, requested, bufs.len());
        self.wait_if_writes_held();

        let max_transfer = {
            let faults = self.inner.faults.lock();
            if faults.failing_write_offsets.contains(&offset.0) {
                return Err(io::Error::other("injected write failure"));
            }
            faults.max_transfer
        };

        let start = usize::try_from(offset.0)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let mut budget = requested.min(max_transfer.unwrap_or(usize::MAX));
        let end = start
            .checked_add(budget)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range overflow"))?;

        let mut bytes = self.inner.bytes.lock();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        let mut pos = start;
        for buf in bufs {
            if budget == 0 {
                break;
            }
            let take = buf.len().min(budget);
            bytes[pos..pos + take].copy_from_slice(&buf[..take]);
            pos += take;
            budget -= take;
        }
        drop(bytes);

        let n = pos - start;
        let mut stats = self.inner.stats.lock();
        stats.writes += 1;
        stats.bytes_written += n as u64;
        Ok(n)
    }

    fn sync(&self) -> io::Result<()> {
        self.record(IoKind::Sync, 0, 0, 0);
        self.inner.stats.lock().syncs += 1;
        Ok(())
    }
}

/// Byte offset `done` bytes past `offset`, as an I/O error on overflow.
pub(crate) fn advance(offset: ByteOffset, done: usize) -> io::Result<ByteOffset> {
    u64::try_from(done)
        .ok()
        .and_then(|done| offset.checked_add(done))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows u64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_short_read_at_eof() {
        let dev = MemByteDevice::with_bytes(vec![7_u8; 6000]);
        let mut a = vec![0_u8; 4096];
        let mut b = vec![0_u8; 4096];
        let n = dev
            .read_vectored_at(ByteOffset(0), &mut [a.as_mut_slice(), b.as_mut_slice()])
            .expect("read");
        assert_eq!(n, 6000);
        assert_eq!(a, vec![7_u8; 4096]);
        assert_eq!(&b[..1904], &[7_u8; 1904][..]);
        assert_eq!(&b[1904..], &[0_u8; 2192][..]);

        let n = dev
            .read_vectored_at(ByteOffset(8192), &mut [a.as_mut_slice()])
            .expect("read past end");
        assert_eq!(n, 0);
    }

    #[test]
    fn mem_device_write_extends_with_zeros() {
        let dev = MemByteDevice::new();
        let n = dev
            .write_vectored_at(ByteOffset(4096), &[&[1_u8; 10][..], &[2_u8; 10][..]])
            .expect("write");
        assert_eq!(n, 20);
        let bytes = dev.snapshot();
        assert_eq!(bytes.len(), 4116);
        assert!(bytes[..4096].iter().all(|b| *b == 0));
        assert_eq!(&bytes[4096..4106], &[1_u8; 10]);
        assert_eq!(&bytes[4106..], &[2_u8; 10]);
    }

    #[test]
    fn mem_device_max_transfer_caps_calls() {
        let dev = MemByteDevice::new();
        dev.set_max_transfer(Some(100));
        let n = dev
            .write_vectored_at(ByteOffset(0), &[&[9_u8; 4096][..]])
            .expect("write");
        assert_eq!(n, 100);

        let mut buf = vec![0_u8; 4096];
        let n = dev
            .read_vectored_at(ByteOffset(0), &mut [buf.as_mut_slice()])
            .expect("read");
        assert_eq!(n, 100);
    }

    #[test]
    fn mem_device_injected_faults_and_log() {
        let dev = MemByteDevice::new();
        dev.fail_next_reads(1);
        dev.fail_writes_at(4096);

        let mut buf = vec![0_u8; 16];
        assert!(dev.read_vectored_at(ByteOffset(0), &mut [buf.as_mut_slice()]).is_err());
        assert!(dev.read_vectored_at(ByteOffset(0), &mut [buf.as_mut_slice()]).is_ok());
        assert!(dev.write_vectored_at(ByteOffset(4096), &[&[1_u8; 4][..]]).is_err());
        assert!(dev.write_vectored_at(ByteOffset(0), &[&[1_u8; 4][..]]).is_ok());
        dev.clear_write_faults();
        assert!(dev.write_vectored_at(ByteOffset(4096), &[&[1_u8; 4][..]]).is_ok());
        dev.sync().expect("sync");

        assert_eq!(dev.calls(IoKind::Read).len(), 2);
        assert_eq!(dev.calls(IoKind::Write).len(), 3);
        assert_eq!(dev.calls(IoKind::Sync).len(), 1);
        let stats = dev.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.bytes_written, 8);
        assert_eq!(stats.syncs, 1);
    }

    #[test]
    fn mem_device_clones_share_bytes() {
        let dev = MemByteDevice::new();
        let other = dev.clone();
        dev.write_vectored_at(ByteOffset(0), &[b"shared".as_slice()])
            .expect("write");
        assert_eq!(other.snapshot(), b"shared".to_vec());
    }

    #[test]
    fn file_device_creates_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.img");

        let dev = FileByteDevice::open(&path).expect("open creates file");
        assert_eq!(dev.path(), path.as_path());
        assert_eq!(dev.len_bytes().unwrap(), 0);

        let n = dev
            .write_vectored_at(ByteOffset(0), &[&[0x11_u8; 4096][..], &[0x22_u8; 4096][..]])
            .expect("write");
        assert_eq!(n, 8192);
        dev.sync().expect("sync");
        assert_eq!(dev.len_bytes().unwrap(), 8192);

        let mut a = vec![0_u8; 4096];
        let mut b = vec![0_u8; 4096];
        let mut c = vec![0_u8; 4096];
        let n = dev
            .read_vectored_at(ByteOffset(0), &mut [a.as_mut_slice(), b.as_mut_slice(), c.as_mut_slice()])
            .expect("read");
        assert_eq!(n, 8192);
        assert_eq!(a, vec![0x11_u8; 4096]);
        assert_eq!(b, vec![0x22_u8; 4096]);
    }

    #[test]
    fn held_writes_block_until_released() {
        let dev = MemByteDevice::new();
        dev.hold_writes();
        std::thread::scope(|s| {
            let writer = s.spawn(|| dev.write_vectored_at(ByteOffset(0), &[&[5_u8; 8][..]]));
            while dev.writes_waiting() == 0 {
                std::thread::yield_now();
            }
            assert!(dev.snapshot().is_empty(), "write landed while held");
            assert_eq!(dev.calls(IoKind::Write).len(), 1);
            dev.release_writes();
            assert_eq!(writer.join().unwrap().expect("write"), 8);
        });
        assert_eq!(dev.writes_waiting(), 0);
        assert_eq!(dev.snapshot(), vec![5_u8; 8]);
    }

    #[test]
    fn file_device_stages_at_most_the_cap_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileByteDevice::open(dir.path().join("big.img")).expect("open");
        let half = MAX_STAGING_BYTES / 2;
        let segments = [vec![0xA1_u8; half], vec![0xB2_u8; half], vec![0xC3_u8; half]];
        let bufs: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();

        let n = dev.write_vectored_at(ByteOffset(0), &bufs).expect("write");
        assert_eq!(n, MAX_STAGING_BYTES);
        assert_eq!(dev.len_bytes().unwrap(), MAX_STAGING_BYTES as u64);

        crate::vectored::write_all_at(&dev, ByteOffset(0), &bufs).expect("write all");
        assert_eq!(dev.len_bytes().unwrap(), (3 * half) as u64);

        let mut out = [vec![0_u8; half], vec![0_u8; half], vec![0_u8; half]];
        let n = {
            let mut views: Vec<&mut [u8]> = out.iter_mut().map(Vec::as_mut_slice).collect();
            dev.read_vectored_at(ByteOffset(0), &mut views).expect("read")
        };
        assert_eq!(n, MAX_STAGING_BYTES);
        assert!(out[2].iter().all(|b| *b == 0));

        crate::vectored::read_exact_or_zero_at(&dev, ByteOffset(0), &mut out).expect("read all");
        assert_eq!(out, segments);
    }

    #[test]
    fn file_device_open_failure_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("blocks.img");
        let err = FileByteDevice::open(&path).unwrap_err();
        match err {
            FbsError::Open { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("expected Open, got {other:?}"),
        }
    }
}
