//! Pipeline configuration and persisted device settings

extern crate alloc;
use alloc::vec::Vec;

use core::fmt;

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::backlog::{STREAM_CHUNK, StorageMedium};
use crate::error::{ConfigError, StorageFault};

/// Timer period between samples
pub const SAMPLE_PERIOD_MS: u32 = 5;

/// Samples per window; 100 × 5 ms = 500 ms
pub const CHUNK_SIZE: usize = 100;

/// Frames per upload, for both direct streaming and backlog draining
pub const STREAMING_BATCH_SIZE: usize = 80;
pub const BACKLOG_BATCH_SIZE: usize = 80;

/// Fewest fresh frames worth a direct upload: 5 s of windows per request
/// instead of one request per window
pub const MIN_STREAM_BATCH: usize = 10;

/// Default collector port
pub const COLLECTOR_PORT: u16 = 8000;

/// Collector path receiving frame uploads
pub const UPLOAD_PATH: &str = "/data";

/// Collector path answering liveness checks
pub const PING_PATH: &str = "/ping";

/// Tunables of the acquisition → transmission pipeline.
///
/// Queue depths are compile-time constants in the firmware; the fields here
/// only describe them so that batch sizes can be checked against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub sample_period_ms: u32,
    pub chunk_size: usize,
    pub streaming_batch: usize,
    pub backlog_batch: usize,
    /// Smallest batch worth a direct upload
    pub min_stream_batch: usize,
    /// Read chunk, in bytes, when streaming the backlog into an upload
    pub stream_chunk: usize,
    pub reconnect_cooldown: Duration,
    pub connect_timeout: Duration,
    /// Bound on one complete request/response exchange
    pub exchange_timeout: Duration,
    /// Pause between transmission cycles
    pub cycle_interval: Duration,
    /// Frames kept in memory when storage refuses them
    pub pending_cap: usize,
    pub upload_path: &'static str,
}

impl PipelineConfig {
    /// Duration of one aggregation window.
    pub fn window_ms(&self) -> u32 {
        self.sample_period_ms.saturating_mul(self.chunk_size as u32)
    }

    pub fn sample_period_s(&self) -> f32 {
        self.sample_period_ms as f32 / 1000.0
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: SAMPLE_PERIOD_MS,
            chunk_size: CHUNK_SIZE,
            streaming_batch: STREAMING_BATCH_SIZE,
            backlog_batch: BACKLOG_BATCH_SIZE,
            min_stream_batch: MIN_STREAM_BATCH,
            stream_chunk: STREAM_CHUNK,
            reconnect_cooldown: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            exchange_timeout: Duration::from_secs(10),
            cycle_interval: Duration::from_millis(250),
            pending_cap: 2 * STREAMING_BATCH_SIZE,
            upload_path: UPLOAD_PATH,
        }
    }
}

/// IPv4 endpoint of the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub ip: [u8; 4],
    pub port: u16,
}

impl ServerAddress {
    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.ip;
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

/// Identity collaborator consumed by the pipeline
pub trait DeviceIdentity {
    /// Boot session, incremented once per boot
    fn session_id(&self) -> u32;
    /// Stable device identifier sent with every upload
    fn device_id(&self) -> &str;
}

/// Settings file on the storage medium
pub const SETTINGS_FILE: &str = "SETTINGS.BIN";

/// Staging file for settings updates
pub const SETTINGS_TMP_FILE: &str = "SETTINGS.TMP";

/// Largest encoded settings record
const SETTINGS_MAX_LEN: usize = 32;

/// Current layout version of [`PersistedSettings`]
pub const SETTINGS_VERSION: u16 = 1;

/// Settings kept across reboots.
///
/// Encoded with postcard. The version is the first field so it can be
/// checked before the rest of the record is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub version: u16,
    pub session_id: u32,
    /// Last collector that answered a liveness check, used as discovery hint
    pub last_server: Option<ServerAddress>,
}

impl PersistedSettings {
    /// Settings for the next boot: same record with the session bumped.
    pub fn next_session(&self) -> Self {
        Self {
            session_id: self.session_id.wrapping_add(1),
            ..*self
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Decode)
    }

    /// Decodes settings, rejecting any layout version but the current one.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        let (version, _) =
            postcard::take_from_bytes::<u16>(bytes).map_err(|_| ConfigError::Decode)?;
        if version != SETTINGS_VERSION {
            return Err(ConfigError::VersionMismatch {
                found: version,
                expected: SETTINGS_VERSION,
            });
        }
        postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)
    }

    /// Decodes settings, falling back to defaults on any error.
    pub fn decode_or_default(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Discarding stored settings: {}", e);
                Self::default()
            }
        }
    }
}

/// Reads the stored settings, defaults when missing or unreadable.
pub fn load_settings<M: StorageMedium>(medium: &mut M) -> PersistedSettings {
    let mut buf = [0u8; SETTINGS_MAX_LEN];
    let read = match medium.read_at(SETTINGS_FILE, 0, &mut buf) {
        Ok(read) => read,
        Err(StorageFault::NotFound) => return PersistedSettings::default(),
        Err(e) => {
            log::warn!("Settings unreadable: {}", e);
            return PersistedSettings::default();
        }
    };
    PersistedSettings::decode_or_default(&buf[..read])
}

/// Replaces the stored settings through a staging file.
pub fn store_settings<M: StorageMedium>(
    medium: &mut M,
    settings: &PersistedSettings,
) -> Result<(), StorageFault> {
    let bytes = settings.encode().map_err(|_| StorageFault::Corrupt)?;
    medium.remove(SETTINGS_TMP_FILE)?;
    medium.append(SETTINGS_TMP_FILE, &bytes)?;
    medium.replace(SETTINGS_TMP_FILE, SETTINGS_FILE)
}

/// Starts a boot session: loads the settings, bumps the session counter and
/// stores the result before any frame of the new session exists.
pub fn begin_session<M: StorageMedium>(medium: &mut M) -> Result<PersistedSettings, StorageFault> {
    let settings = load_settings(medium).next_session();
    store_settings(medium, &settings)?;
    Ok(settings)
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            session_id: 0,
            last_server: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::memory::MemoryMedium;
    use alloc::string::ToString;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.window_ms(), 500);
        assert_eq!(config.streaming_batch, 80);
        assert!(config.min_stream_batch > 1 && config.min_stream_batch <= config.streaming_batch);
        assert_eq!(config.reconnect_cooldown, Duration::from_secs(10));
        assert_eq!(config.upload_path, "/data");
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = PersistedSettings {
            last_server: Some(ServerAddress::new([192, 168, 1, 20], 8000)),
            ..PersistedSettings::default()
        }
        .next_session();

        let bytes = settings.encode().unwrap();
        let decoded = PersistedSettings::decode(&bytes).unwrap();

        assert_eq!(decoded, settings);
        assert_eq!(decoded.session_id, 1);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let settings = PersistedSettings {
            version: SETTINGS_VERSION + 1,
            ..PersistedSettings::default()
        };
        let bytes = settings.encode().unwrap();

        assert_eq!(
            PersistedSettings::decode(&bytes),
            Err(ConfigError::VersionMismatch {
                found: SETTINGS_VERSION + 1,
                expected: SETTINGS_VERSION
            })
        );
        assert_eq!(
            PersistedSettings::decode_or_default(&bytes),
            PersistedSettings::default()
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(PersistedSettings::decode(&[]), Err(ConfigError::Decode));
        assert_eq!(
            PersistedSettings::decode(&[SETTINGS_VERSION as u8]),
            Err(ConfigError::Decode)
        );
    }

    #[test]
    fn test_sessions_increase_across_boots() {
        let mut medium = MemoryMedium::with_capacity(4096);

        let first = begin_session(&mut medium).unwrap();
        let second = begin_session(&mut medium).unwrap();

        assert_eq!(first.session_id, 1);
        assert_eq!(second.session_id, 2);
        assert_eq!(load_settings(&mut medium), second);
        assert!(!medium.files.contains_key(SETTINGS_TMP_FILE));
    }

    #[test]
    fn test_corrupt_settings_fall_back_to_defaults() {
        let mut medium = MemoryMedium::with_capacity(4096);
        medium
            .files
            .insert(SETTINGS_FILE.to_string(), alloc::vec![9, 9, 9]);

        assert_eq!(load_settings(&mut medium), PersistedSettings::default());
        assert_eq!(begin_session(&mut medium).unwrap().session_id, 1);
    }

    #[test]
    fn test_server_address_display() {
        let addr = ServerAddress::new([10, 0, 0, 7], 8000);
        assert_eq!(addr.to_string(), "10.0.0.7:8000");
    }
}
