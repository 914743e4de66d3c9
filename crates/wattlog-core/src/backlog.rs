//! Persistent backlog of undelivered frames
//!
//! The backlog is a single headerless file of concatenated
//! [`ProcessedFrame`] records in creation order. It is appended to at the end
//! and shrunk only from the front, once the collector has acknowledged the
//! oldest records.
//!
//! The storage medium has no truncate-from-front primitive, so a prefix
//! deletion copies the surviving suffix into a temporary file and replaces the
//! log with it. A small commit file records that the copy finished, which lets
//! [`BacklogStore::open`] finish or discard an interrupted rewrite after a
//! power loss. Opening also trims a torn trailing record, so the log length
//! is a multiple of [`FRAME_SIZE`] whenever the store is observable.

extern crate alloc;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::error::{BacklogError, StorageFault};
use crate::frame::{FRAME_SIZE, ProcessedFrame, decode_processed, encode_all};

/// Backlog file (8.3 name, FAT friendly)
pub const LOG_FILE: &str = "BACKLOG.DAT";

/// Destination of the suffix copy during a prefix deletion
pub const TMP_FILE: &str = "BACKLOG.TMP";

/// Present only between a completed suffix copy and the replace of the log
pub const COMMIT_FILE: &str = "BACKLOG.CMT";

/// Buffer size used when copying between files
pub const COPY_CHUNK: usize = 512;

/// Default read chunk of [`BacklogStore::stream`], in bytes
pub const STREAM_CHUNK: usize = 8 * FRAME_SIZE;

/// Byte-oriented file storage.
///
/// Implementations are blocking; every call runs to completion before the
/// caller continues.
pub trait StorageMedium {
    /// Bytes available for new data.
    fn bytes_free(&mut self) -> Result<u64, StorageFault>;

    /// Length of `name`, zero if it does not exist.
    fn len(&mut self, name: &str) -> Result<u64, StorageFault>;

    /// Appends `data` to `name`, creating it if needed.
    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageFault>;

    /// Reads from `name` at `offset` into `buf`, returning the bytes read.
    /// Zero means end of file.
    fn read_at(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageFault>;

    /// Deletes `name`. Deleting a missing file succeeds.
    fn remove(&mut self, name: &str) -> Result<(), StorageFault>;

    /// Replaces `to` with the contents of `from`, which no longer exists
    /// afterwards. Repeating an interrupted replace must be safe.
    fn replace(&mut self, from: &str, to: &str) -> Result<(), StorageFault>;
}

impl<M: StorageMedium + ?Sized> StorageMedium for &mut M {
    fn bytes_free(&mut self) -> Result<u64, StorageFault> {
        (**self).bytes_free()
    }

    fn len(&mut self, name: &str) -> Result<u64, StorageFault> {
        (**self).len(name)
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageFault> {
        (**self).append(name, data)
    }

    fn read_at(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageFault> {
        (**self).read_at(name, offset, buf)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageFault> {
        (**self).remove(name)
    }

    fn replace(&mut self, from: &str, to: &str) -> Result<(), StorageFault> {
        (**self).replace(from, to)
    }
}

/// Allocates a zeroed read buffer, `None` when the heap cannot satisfy it.
pub type ChunkAllocator = fn(usize) -> Option<Vec<u8>>;

/// Fallible heap allocation of a read chunk.
pub fn try_alloc_chunk(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

pub struct BacklogStore<M: StorageMedium> {
    medium: M,
    alloc_chunk: ChunkAllocator,
}

impl<M: StorageMedium> BacklogStore<M> {
    /// Opens the backlog, repairing anything a power loss left behind.
    pub fn open(medium: M) -> Result<Self, BacklogError> {
        Self::open_with_allocator(medium, try_alloc_chunk)
    }

    pub fn open_with_allocator(medium: M, alloc_chunk: ChunkAllocator) -> Result<Self, BacklogError> {
        let mut store = Self {
            medium,
            alloc_chunk,
        };
        store.recover()?;

        let size = store.backlog_size()?;
        if size > 0 {
            info!("Backlog holds {} frames", size / FRAME_SIZE as u64);
        }
        Ok(store)
    }

    fn recover(&mut self) -> Result<(), BacklogError> {
        let mut commit = [0u8; 8];
        let committed = if self.medium.len(COMMIT_FILE)? == commit.len() as u64 {
            self.medium.read_at(COMMIT_FILE, 0, &mut commit)? == commit.len()
        } else {
            false
        };

        if committed {
            let expected = u64::from_le_bytes(commit);
            if self.medium.len(TMP_FILE)? == expected {
                warn!("Completing interrupted backlog rewrite");
                self.medium.replace(TMP_FILE, LOG_FILE)?;
            }
        } else if self.medium.len(TMP_FILE)? > 0 {
            warn!("Discarding incomplete backlog rewrite");
        }
        self.medium.remove(TMP_FILE)?;
        self.medium.remove(COMMIT_FILE)?;

        let len = self.medium.len(LOG_FILE)?;
        let torn = len % FRAME_SIZE as u64;
        if torn != 0 {
            warn!("Trimming {} bytes of torn backlog record", torn);
            let whole = len - torn;
            if whole == 0 {
                self.medium.remove(LOG_FILE)?;
            } else {
                self.rewrite(0, whole)?;
            }
        }
        Ok(())
    }

    /// Total bytes in the backlog, always a multiple of [`FRAME_SIZE`].
    pub fn backlog_size(&mut self) -> Result<u64, BacklogError> {
        Ok(self.medium.len(LOG_FILE)?)
    }

    pub fn frame_count(&mut self) -> Result<usize, BacklogError> {
        Ok((self.backlog_size()? / FRAME_SIZE as u64) as usize)
    }

    pub fn is_empty(&mut self) -> Result<bool, BacklogError> {
        Ok(self.backlog_size()? == 0)
    }

    /// Frames that would still fit in the free space of the medium.
    pub fn remaining_frames(&mut self) -> Result<u64, BacklogError> {
        Ok(self.medium.bytes_free()? / FRAME_SIZE as u64)
    }

    /// Appends `frames` in order.
    ///
    /// Refuses with [`BacklogError::StorageFull`] when the batch would take
    /// more than half of the remaining free space. The space already held by
    /// the log counts as spent twice, since [`delete_prefix`] needs room for
    /// a copy of it: the log never grows past half of what it and the free
    /// space add up to.
    ///
    /// [`delete_prefix`]: Self::delete_prefix
    pub fn write(&mut self, frames: &[ProcessedFrame]) -> Result<(), BacklogError> {
        if frames.is_empty() {
            return Ok(());
        }

        let requested = frames.len() * FRAME_SIZE;
        let available = self.medium.bytes_free()?;
        let held = self.backlog_size()?;
        if held + requested as u64 > (held + available) / 2 {
            warn!(
                "Backlog write of {} bytes refused, {} bytes free",
                requested, available
            );
            return Err(BacklogError::StorageFull {
                requested: requested as u32,
                available,
            });
        }

        let mut bytes = Vec::new();
        encode_all(frames, &mut bytes);
        self.medium.append(LOG_FILE, &bytes)?;

        debug!(
            "Backlogged {} frames, room for {} more",
            frames.len(),
            (available - requested as u64) / FRAME_SIZE as u64
        );
        Ok(())
    }

    /// Reads up to `count` frames from the front of the log.
    pub fn read_batch(&mut self, count: usize) -> Result<Vec<ProcessedFrame>, BacklogError> {
        let available = self.frame_count()?;
        let count = count.min(available);

        let mut frames = Vec::with_capacity(count);
        let mut record = [0u8; FRAME_SIZE];
        for i in 0..count {
            let offset = (i * FRAME_SIZE) as u64;
            let read = self.medium.read_at(LOG_FILE, offset, &mut record)?;
            frames.push(decode_processed(&record[..read])?);
        }
        Ok(frames)
    }

    /// Lazily reads up to `max_frames` frames from the front of the log as
    /// byte chunks of at most `chunk` bytes, without loading them all at once.
    ///
    /// `chunk` is rounded down to whole frames, and is never below one frame.
    pub fn stream(&mut self, max_frames: usize, chunk: usize) -> Result<BacklogStream<'_, M>, BacklogError> {
        let limit = (max_frames * FRAME_SIZE) as u64;
        let end = self.backlog_size()?.min(limit);
        Ok(BacklogStream {
            store: self,
            offset: 0,
            end,
            chunk: (chunk / FRAME_SIZE).max(1) * FRAME_SIZE,
            failed: false,
        })
    }

    /// Removes the oldest `count` frames.
    ///
    /// Deletes the whole file when `count` covers it, otherwise rewrites the
    /// suffix through the temporary file.
    pub fn delete_prefix(&mut self, count: usize) -> Result<(), BacklogError> {
        if count == 0 {
            return Ok(());
        }

        let len = self.backlog_size()?;
        let skip = (count * FRAME_SIZE) as u64;
        if len <= skip {
            self.medium.remove(LOG_FILE)?;
            debug!("Backlog cleared");
            return Ok(());
        }

        self.rewrite(skip, len - skip)?;
        debug!("Deleted {} frames from backlog", count);
        Ok(())
    }

    /// Replaces the log with its bytes `skip..skip + keep`.
    fn rewrite(&mut self, skip: u64, keep: u64) -> Result<(), BacklogError> {
        self.medium.remove(TMP_FILE)?;
        self.medium.remove(COMMIT_FILE)?;

        let mut buf = [0u8; COPY_CHUNK];
        let mut copied = 0u64;
        while copied < keep {
            let want = ((keep - copied) as usize).min(COPY_CHUNK);
            let read = self.medium.read_at(LOG_FILE, skip + copied, &mut buf[..want])?;
            if read == 0 {
                return Err(StorageFault::Corrupt.into());
            }
            self.medium.append(TMP_FILE, &buf[..read])?;
            copied += read as u64;
        }

        self.medium.append(COMMIT_FILE, &keep.to_le_bytes())?;
        self.medium.replace(TMP_FILE, LOG_FILE)?;
        self.medium.remove(COMMIT_FILE)?;
        Ok(())
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.medium
    }
}

/// Chunked reader over the front of the backlog.
///
/// Reads in chunks of the size given to [`BacklogStore::stream`]. When a
/// chunk cannot be allocated the chunk size is halved (rounded down to whole frames) and the
/// allocation retried; below one frame the stream yields
/// [`BacklogError::AllocationFailure`] and ends.
pub struct BacklogStream<'a, M: StorageMedium> {
    store: &'a mut BacklogStore<M>,
    offset: u64,
    end: u64,
    chunk: usize,
    failed: bool,
}

impl<M: StorageMedium> BacklogStream<'_, M> {
    /// Bytes the stream covers in total.
    pub fn total_bytes(&self) -> u64 {
        self.end
    }

    /// Whole frames the stream covers.
    pub fn frame_count(&self) -> usize {
        (self.end / FRAME_SIZE as u64) as usize
    }

    /// Current read chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn allocate(&mut self, remaining: usize) -> Result<Vec<u8>, BacklogError> {
        loop {
            let want = self.chunk.min(remaining);
            if let Some(buf) = (self.store.alloc_chunk)(want) {
                return Ok(buf);
            }
            if want <= FRAME_SIZE {
                return Err(BacklogError::AllocationFailure { chunk: want });
            }
            let halved = (want / 2) / FRAME_SIZE * FRAME_SIZE;
            self.chunk = halved.max(FRAME_SIZE);
            debug!("Read chunk shrunk to {} bytes", self.chunk);
        }
    }
}

impl<M: StorageMedium> Iterator for BacklogStream<'_, M> {
    type Item = Result<Vec<u8>, BacklogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.end {
            return None;
        }

        let remaining = (self.end - self.offset) as usize;
        let mut buf = match self.allocate(remaining) {
            Ok(buf) => buf,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        match self.store.medium.read_at(LOG_FILE, self.offset, &mut buf) {
            Ok(0) => {
                self.failed = true;
                Some(Err(StorageFault::Corrupt.into()))
            }
            Ok(read) => {
                buf.truncate(read);
                self.offset += read as u64;
                Some(Ok(buf))
            }
            Err(fault) => {
                self.failed = true;
                Some(Err(fault.into()))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryMedium;
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn frames(ids: core::ops::Range<u32>) -> Vec<ProcessedFrame> {
        ids.map(|id| ProcessedFrame {
            measurement_id: id,
            avg_power: id as f32 * 0.5,
            ..Default::default()
        })
        .collect()
    }

    fn ids(frames: &[ProcessedFrame]) -> Vec<u32> {
        frames.iter().map(|f| f.measurement_id).collect()
    }

    fn store() -> BacklogStore<MemoryMedium> {
        BacklogStore::open(MemoryMedium::with_capacity(1 << 20)).unwrap()
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let mut store = store();
        store.write(&frames(0..5)).unwrap();
        store.write(&frames(5..8)).unwrap();

        assert_eq!(store.frame_count().unwrap(), 8);
        assert_eq!(ids(&store.read_batch(3).unwrap()), vec![0, 1, 2]);
        assert_eq!(ids(&store.read_batch(100).unwrap()).len(), 8);
    }

    #[test]
    fn test_size_stays_frame_aligned() {
        let mut store = store();
        store.write(&frames(0..10)).unwrap();
        store.delete_prefix(3).unwrap();
        store.write(&frames(10..11)).unwrap();
        store.delete_prefix(1).unwrap();
        store.write(&[]).unwrap();
        store.delete_prefix(0).unwrap();

        let size = store.backlog_size().unwrap();
        assert_eq!(size % FRAME_SIZE as u64, 0);
        assert_eq!(size, 7 * FRAME_SIZE as u64);
        assert_eq!(ids(&store.read_batch(100).unwrap()), vec![4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_delete_prefix_covering_everything_removes_file() {
        let mut store = store();
        store.write(&frames(0..3)).unwrap();
        store.delete_prefix(5).unwrap();

        assert!(store.is_empty().unwrap());
        assert!(!store.medium_mut().files.contains_key(LOG_FILE));
        assert!(!store.medium_mut().files.contains_key(TMP_FILE));
        assert!(!store.medium_mut().files.contains_key(COMMIT_FILE));
    }

    #[test]
    fn test_write_refused_above_half_free_space() {
        let capacity = 10 * FRAME_SIZE as u64;
        let mut store = BacklogStore::open(MemoryMedium::with_capacity(capacity)).unwrap();

        assert_eq!(
            store.write(&frames(0..6)),
            Err(BacklogError::StorageFull {
                requested: 6 * FRAME_SIZE as u32,
                available: capacity
            })
        );
        assert!(store.is_empty().unwrap());

        store.write(&frames(0..5)).unwrap();
        assert_eq!(store.remaining_frames().unwrap(), 5);
        assert!(matches!(
            store.write(&frames(5..8)),
            Err(BacklogError::StorageFull { .. })
        ));
    }

    #[test]
    fn test_log_keeps_room_for_its_own_rewrite() {
        let capacity = 100 * FRAME_SIZE as u64;
        let mut store = BacklogStore::open(MemoryMedium::with_capacity(capacity)).unwrap();

        store.write(&frames(0..35)).unwrap();
        // Fits in half of the free space, but not beside a copy of the log
        assert!(matches!(
            store.write(&frames(35..55)),
            Err(BacklogError::StorageFull { .. })
        ));
        store.write(&frames(35..50)).unwrap();
        assert!(matches!(
            store.write(&frames(50..51)),
            Err(BacklogError::StorageFull { .. })
        ));

        let mut expected = 0;
        while !store.is_empty().unwrap() {
            let batch = store.read_batch(4).unwrap();
            assert_eq!(batch[0].measurement_id, expected);
            store.delete_prefix(batch.len()).unwrap();
            expected += batch.len() as u32;
        }
        assert_eq!(expected, 50);
    }

    #[test]
    fn test_io_fault_surfaces() {
        let mut store = store();
        store.medium_mut().fail_io = true;
        assert_eq!(
            store.write(&frames(0..1)),
            Err(BacklogError::Storage(StorageFault::Io))
        );
    }

    #[test]
    fn test_stream_is_bounded_and_ordered() {
        let mut store = store();
        store.write(&frames(0..10)).unwrap();

        let stream = store.stream(4, STREAM_CHUNK).unwrap();
        assert_eq!(stream.frame_count(), 4);
        assert_eq!(stream.total_bytes(), 4 * FRAME_SIZE as u64);

        let bytes: Vec<u8> = stream.map(|c| c.unwrap()).flatten().collect();
        assert_eq!(bytes.len(), 4 * FRAME_SIZE);
        let last = decode_processed(&bytes[3 * FRAME_SIZE..]).unwrap();
        assert_eq!(last.measurement_id, 3);
    }

    #[test]
    fn test_stream_of_empty_backlog_is_empty() {
        let mut store = store();
        assert_eq!(store.stream(80, STREAM_CHUNK).unwrap().count(), 0);
    }

    #[test]
    fn test_stream_reads_in_whole_frame_chunks() {
        let mut store = store();
        store.write(&frames(0..5)).unwrap();

        let lens: Vec<usize> = store
            .stream(5, 2 * FRAME_SIZE + 7)
            .unwrap()
            .map(|c| c.unwrap().len())
            .collect();
        assert_eq!(lens, vec![2 * FRAME_SIZE, 2 * FRAME_SIZE, FRAME_SIZE]);

        let stream = store.stream(5, 0).unwrap();
        assert_eq!(stream.chunk_size(), FRAME_SIZE);
        assert_eq!(stream.count(), 5);
    }

    fn at_most_two_frames(len: usize) -> Option<Vec<u8>> {
        if len > 2 * FRAME_SIZE {
            None
        } else {
            Some(vec![0; len])
        }
    }

    #[test]
    fn test_stream_shrinks_chunk_on_allocation_failure() {
        let medium = MemoryMedium::with_capacity(1 << 20);
        let mut store = BacklogStore::open_with_allocator(medium, at_most_two_frames).unwrap();
        store.write(&frames(0..8)).unwrap();

        let mut stream = store.stream(8, 8 * FRAME_SIZE).unwrap();
        let first = stream.next().unwrap().unwrap();
        // 320 -> 160 -> 80
        assert_eq!(first.len(), 2 * FRAME_SIZE);
        assert_eq!(stream.chunk_size(), 2 * FRAME_SIZE);

        let rest: usize = stream.map(|c| c.unwrap().len()).sum();
        assert_eq!(rest, 6 * FRAME_SIZE);
    }

    fn never(_: usize) -> Option<Vec<u8>> {
        None
    }

    #[test]
    fn test_stream_gives_up_below_one_frame() {
        let medium = MemoryMedium::with_capacity(1 << 20);
        let mut store = BacklogStore::open_with_allocator(medium, never).unwrap();
        store.write(&frames(0..4)).unwrap();

        let mut stream = store.stream(4, STREAM_CHUNK).unwrap();
        assert_eq!(
            stream.next(),
            Some(Err(BacklogError::AllocationFailure { chunk: FRAME_SIZE }))
        );
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_open_trims_torn_record() {
        let mut medium = MemoryMedium::with_capacity(1 << 20);
        let mut bytes = Vec::new();
        encode_all(&frames(0..3), &mut bytes);
        bytes.extend_from_slice(&[0xAA; 7]);
        medium.files.insert(LOG_FILE.to_string(), bytes);

        let mut store = BacklogStore::open(medium).unwrap();
        assert_eq!(store.backlog_size().unwrap(), 3 * FRAME_SIZE as u64);
        assert_eq!(ids(&store.read_batch(3).unwrap()), vec![0, 1, 2]);
    }

    #[test]
    fn test_open_discards_uncommitted_rewrite() {
        let mut medium = MemoryMedium::with_capacity(1 << 20);
        let mut log = Vec::new();
        encode_all(&frames(0..4), &mut log);
        medium.files.insert(LOG_FILE.to_string(), log);
        medium.files.insert(TMP_FILE.to_string(), vec![1, 2, 3]);

        let mut store = BacklogStore::open(medium).unwrap();
        assert_eq!(store.frame_count().unwrap(), 4);
        assert!(!store.medium_mut().files.contains_key(TMP_FILE));
    }

    #[test]
    fn test_open_completes_committed_rewrite() {
        let mut medium = MemoryMedium::with_capacity(1 << 20);
        let mut log = Vec::new();
        encode_all(&frames(0..4), &mut log);
        let mut suffix = Vec::new();
        encode_all(&frames(2..4), &mut suffix);

        medium
            .files
            .insert(COMMIT_FILE.to_string(), (suffix.len() as u64).to_le_bytes().to_vec());
        medium.files.insert(LOG_FILE.to_string(), log);
        medium.files.insert(TMP_FILE.to_string(), suffix);

        let mut store = BacklogStore::open(medium).unwrap();
        assert_eq!(ids(&store.read_batch(10).unwrap()), vec![2, 3]);
        assert!(!store.medium_mut().files.contains_key(COMMIT_FILE));
    }
}
