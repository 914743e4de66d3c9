//! FAT volume on the SD card as a [`StorageMedium`]
//!
//! Operations are blocking, as is every embedded-sdmmc call. Each one opens
//! the volume and root directory, does its work and closes everything again
//! so that no handle outlives a call.
//!
//! FAT has no atomic rename. [`StorageMedium::replace`] truncates the target,
//! copies the source over and only then deletes the source, so a replace cut
//! short by a reset is completed by repeating it.

use embedded_sdmmc::{
    Directory, Error, Mode, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager,
};
use log::warn;

use wattlog_core::StorageFault;
use wattlog_core::backlog::{COPY_CHUNK, StorageMedium};

const MAX_DIRS: usize = 4;
const MAX_FILES: usize = 4;
const MAX_VOLUMES: usize = 1;

type SdError = Error<SdCardError>;
type Root<'a, S, D, T> = Directory<'a, SdCard<S, D>, T, MAX_DIRS, MAX_FILES, MAX_VOLUMES>;

/// Timestamps written into directory entries.
///
/// There is no wall clock on the board; every file gets the same date.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

fn map_error(e: SdError) -> StorageFault {
    match e {
        Error::NotFound => StorageFault::NotFound,
        Error::DiskFull | Error::NotEnoughSpace => StorageFault::NoSpace,
        Error::FormatError(_) | Error::BadCluster | Error::UnterminatedFatChain => {
            StorageFault::Corrupt
        }
        other => {
            warn!("SD card error: {:?}", other);
            StorageFault::Io
        }
    }
}

pub struct SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, MAX_DIRS, MAX_FILES, MAX_VOLUMES>,
    /// Bytes the root directory may hold in total
    quota: u64,
}

impl<S, D, T> SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    /// Wraps an initialised card, allowing at most `quota` bytes of files.
    ///
    /// The quota is clamped to the card size when the card reports one.
    pub fn new(sd_card: SdCard<S, D>, ts: T, quota: u64) -> Self {
        let quota = match sd_card.num_bytes() {
            Ok(card_bytes) => quota.min(card_bytes),
            Err(e) => {
                warn!("SD card size unknown ({:?}), using quota as is", e);
                quota
            }
        };
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self { volume_mgr, quota }
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Runs `f` with the root directory open.
    fn in_root<R>(&self, f: impl FnOnce(&Root<'_, S, D, T>) -> Result<R, SdError>) -> Result<R, SdError> {
        let volume = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root = volume.open_root_dir()?;

        let value = f(&root)?;

        root.close()?;
        volume.close()?;
        Ok(value)
    }
}

impl<S, D, T> StorageMedium for SdCardMedium<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn bytes_free(&mut self) -> Result<u64, StorageFault> {
        let used = self
            .in_root(|root| {
                let mut used = 0u64;
                root.iterate_dir(|entry| {
                    if !entry.attributes.is_directory() {
                        used += u64::from(entry.size);
                    }
                })?;
                Ok(used)
            })
            .map_err(map_error)?;
        Ok(self.quota.saturating_sub(used))
    }

    fn len(&mut self, name: &str) -> Result<u64, StorageFault> {
        self.in_root(|root| match root.open_file_in_dir(name, Mode::ReadOnly) {
            Ok(file) => {
                let len = file.length();
                file.close()?;
                Ok(u64::from(len))
            }
            Err(Error::NotFound) => Ok(0),
            Err(e) => Err(e),
        })
        .map_err(map_error)
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), StorageFault> {
        self.in_root(|root| {
            let file = root.open_file_in_dir(name, Mode::ReadWriteCreateOrAppend)?;
            file.write(data)?;
            file.close()
        })
        .map_err(map_error)
    }

    fn read_at(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageFault> {
        let offset = u32::try_from(offset).map_err(|_| StorageFault::Corrupt)?;
        self.in_root(|root| {
            let file = root.open_file_in_dir(name, Mode::ReadOnly)?;
            if offset >= file.length() {
                file.close()?;
                return Ok(0);
            }
            file.seek_from_start(offset)?;

            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            file.close()?;
            Ok(filled)
        })
        .map_err(map_error)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageFault> {
        self.in_root(|root| match root.delete_file_in_dir(name) {
            Ok(()) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        })
        .map_err(map_error)
    }

    fn replace(&mut self, from: &str, to: &str) -> Result<(), StorageFault> {
        self.in_root(|root| {
            let source = match root.open_file_in_dir(from, Mode::ReadOnly) {
                Ok(file) => file,
                // Source already consumed by an earlier, completed attempt
                Err(Error::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            let target = root.open_file_in_dir(to, Mode::ReadWriteCreateOrTruncate)?;

            let mut chunk = [0u8; COPY_CHUNK];
            loop {
                let n = source.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                target.write(&chunk[..n])?;
            }
            target.close()?;
            source.close()?;

            root.delete_file_in_dir(from)
        })
        .map_err(map_error)
    }
}
