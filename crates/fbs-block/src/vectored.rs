//! Whole-transfer helpers on top of partial-completion devices.
//!
//! A device call may transfer fewer bytes than requested. These helpers
//! reissue the call for exactly the untransferred tail of the segment list
//! until the request is satisfied:
//!
//! - reads stop early at end-of-file and zero-fill whatever is left;
//! - a write that makes no progress fails with `WriteZero`.

use crate::device::{ByteDevice, advance};
use fbs_types::{BlockIndex, ByteOffset};
use std::io;
use std::ops::Range;

/// Segments of `bufs` remaining after the first `skip` bytes.
fn tail_mut(bufs: &mut [Vec<u8>], mut skip: usize) -> Vec<&mut [u8]> {
    let mut out = Vec::with_capacity(bufs.len());
    for buf in bufs.iter_mut() {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.push(&mut buf[skip..]);
        skip = 0;
    }
    out
}

fn tail<'a>(bufs: &[&'a [u8]], mut skip: usize) -> Vec<&'a [u8]> {
    let mut out = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.push(&buf[skip..]);
        skip = 0;
    }
    out
}

/// Fill every buffer in `bufs` from `offset` onward.
///
/// Short reads are continued from where they stopped. A zero-length read
/// means end-of-file: the remaining tail is zero-filled and the call
/// succeeds.
pub fn read_exact_or_zero_at<D: ByteDevice + ?Sized>(
    device: &D,
    offset: ByteOffset,
    bufs: &mut [Vec<u8>],
) -> io::Result<()> {
    let total: usize = bufs.iter().map(Vec::len).sum();
    let mut done = 0;
    while done < total {
        let pos = advance(offset, done)?;
        let mut remaining = tail_mut(bufs, done);
        let n = match device.read_vectored_at(pos, &mut remaining) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if n == 0 {
            for segment in remaining {
                segment.fill(0);
            }
            return Ok(());
        }
        done += n.min(total - done);
    }
    Ok(())
}

/// Write every buffer in `bufs` starting at `offset`.
///
/// Short writes are continued with the unwritten tail.
pub fn write_all_at<D: ByteDevice + ?Sized>(
    device: &D,
    offset: ByteOffset,
    bufs: &[&[u8]],
) -> io::Result<()> {
    let total: usize = bufs.iter().map(|buf| buf.len()).sum();
    let mut done = 0;
    while done < total {
        let pos = advance(offset, done)?;
        let remaining = tail(bufs, done);
        let n = match device.write_vectored_at(pos, &remaining) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("device accepted no bytes at offset {pos}"),
            ));
        }
        done += n.min(total - done);
    }
    Ok(())
}

/// Partition ascending `indices` into maximal runs of strictly consecutive
/// indices, each at most `max_run` long.
///
/// Returns position ranges into `indices`.
#[must_use]
pub fn coalesce_runs(indices: &[BlockIndex], max_run: usize) -> Vec<Range<usize>> {
    let max_run = max_run.max(1);
    let mut runs = Vec::new();
    let mut start = 0;
    for pos in 1..indices.len() {
        let len = pos - start;
        let consecutive = indices[pos - 1].checked_add(1) == Some(indices[pos]);
        if !consecutive || len >= max_run {
            runs.push(start..pos);
            start = pos;
        }
    }
    if start < indices.len() {
        runs.push(start..indices.len());
    }
    runs
}
