//! Persisted Settings Store
//!
//! Write-through store for the settings the `#` setup commands change.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//! 0       1     magic b'S'
//! 1       1     layout version (1)
//! 2       2     servo_directions (u16 LE, bit n-1 = channel n reversed)
//! 4       1     startup_sound (0 = silent, 1-3)
//! 5       1     quiet_mode (0/1)
//! 6       2     slave_delay_ms (u16 LE, 0-10000)
//! 8       1     sound_module (0 MP3 Trigger, 1 DFPlayer, 2 Vocalizer)
//! 9       4     CRC32 of bytes 0..9 (u32 LE)
//! ```
//!
//! A record that fails any check is replaced by defaults and the store is
//! marked dirty. Loading never fails.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{MAX_SLAVE_DELAY_MS, PANEL_COUNT};

const MAGIC: u8 = b'S';
const LAYOUT_VERSION: u8 = 1;
const PAYLOAD_LEN: usize = 9;

/// Encoded record length in bytes
pub const RECORD_LEN: usize = PAYLOAD_LEN + 4;

/// Highest startup sound selector
pub const MAX_STARTUP_SOUND: u8 = 3;

// ============================================================================
// Settings
// ============================================================================

/// Attached sound hardware
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundModule {
    /// SparkFun MP3 Trigger
    #[default]
    Mp3Trigger,
    /// DFPlayer Mini
    DfPlayer,
    /// Human Cyborg Relations Vocalizer
    Vocalizer,
}

impl SoundModule {
    /// Wire and storage code
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Mp3Trigger => 0,
            Self::DfPlayer => 1,
            Self::Vocalizer => 2,
        }
    }

    /// Module for a wire or storage code
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Mp3Trigger),
            1 => Some(Self::DfPlayer),
            2 => Some(Self::Vocalizer),
            _ => None,
        }
    }
}

/// Current settings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reversed servo channels, bit n-1 = channel n
    pub servo_directions: u16,
    /// Startup sound (0 = silent)
    pub startup_sound: u8,
    /// Suppress the startup sound and random sounds
    pub quiet_mode: bool,
    /// Delay before forwarding commands to the slave board
    pub slave_delay_ms: u16,
    /// Attached sound hardware
    pub sound_module: SoundModule,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servo_directions: 0,
            startup_sound: 1,
            quiet_mode: false,
            slave_delay_ms: 0,
            sound_module: SoundModule::Mp3Trigger,
        }
    }
}

impl Settings {
    /// Whether `channel` (1-based) is mounted in reverse
    #[must_use]
    pub fn is_reversed(&self, channel: u8) -> bool {
        (1..=16).contains(&channel) && self.servo_directions & (1 << (channel - 1)) != 0
    }

    /// Encode into the persisted layout
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = MAGIC;
        out[1] = LAYOUT_VERSION;
        out[2..4].copy_from_slice(&self.servo_directions.to_le_bytes());
        out[4] = self.startup_sound;
        out[5] = u8::from(self.quiet_mode);
        out[6..8].copy_from_slice(&self.slave_delay_ms.to_le_bytes());
        out[8] = self.sound_module.code();
        let crc = crc32fast::hash(&out[..PAYLOAD_LEN]);
        out[PAYLOAD_LEN..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode and verify a persisted record
    ///
    /// # Errors
    ///
    /// `ChecksumMismatch` if the CRC does not match, `InvalidRecord` for a
    /// wrong length, magic, version or out-of-range field.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigStoreError> {
        let invalid = |reason: String| ConfigStoreError::InvalidRecord { reason };

        if bytes.len() != RECORD_LEN {
            return Err(invalid(format!(
                "expected {RECORD_LEN} bytes, found {}",
                bytes.len()
            )));
        }
        let (payload, crc) = bytes.split_at(PAYLOAD_LEN);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(ConfigStoreError::ChecksumMismatch { stored, computed });
        }
        if payload[0] != MAGIC {
            return Err(invalid(format!("bad magic byte {:#04x}", payload[0])));
        }
        if payload[1] != LAYOUT_VERSION {
            return Err(invalid(format!("unsupported layout version {}", payload[1])));
        }

        let settings = Self {
            servo_directions: u16::from_le_bytes([payload[2], payload[3]]),
            startup_sound: payload[4],
            quiet_mode: match payload[5] {
                0 => false,
                1 => true,
                other => return Err(invalid(format!("quiet_mode byte {other}"))),
            },
            slave_delay_ms: u16::from_le_bytes([payload[6], payload[7]]),
            sound_module: SoundModule::from_code(payload[8])
                .ok_or_else(|| invalid(format!("sound module code {}", payload[8])))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigStoreError> {
        if self.startup_sound > MAX_STARTUP_SOUND {
            return Err(ConfigStoreError::InvalidValue {
                field: ConfigField::StartupSound,
                reason: format!("{} exceeds {MAX_STARTUP_SOUND}", self.startup_sound),
            });
        }
        if u32::from(self.slave_delay_ms) > MAX_SLAVE_DELAY_MS {
            return Err(ConfigStoreError::InvalidValue {
                field: ConfigField::SlaveDelay,
                reason: format!("{}ms exceeds {MAX_SLAVE_DELAY_MS}ms", self.slave_delay_ms),
            });
        }
        Ok(())
    }
}

/// Settings field names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    /// Servo direction bitmask
    ServoDirections,
    /// Startup sound selector
    StartupSound,
    /// Quiet mode flag
    QuietMode,
    /// Slave delay in milliseconds
    SlaveDelay,
    /// Sound module selection
    SoundModule,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServoDirections => "servo_directions",
            Self::StartupSound => "startup_sound",
            Self::QuietMode => "quiet_mode",
            Self::SlaveDelay => "slave_delay_ms",
            Self::SoundModule => "sound_module",
        };
        f.write_str(s)
    }
}

/// A change to one setting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum Setting {
    /// Replace the whole direction mask
    ServoDirections(u16),
    /// Flip one channel (1-based)
    ServoReversed {
        /// Channel
        channel: u8,
        /// Reversed or normal
        reversed: bool,
    },
    /// Startup sound (0 = silent)
    StartupSound(u8),
    /// Quiet mode
    QuietMode(bool),
    /// Slave delay in milliseconds
    SlaveDelay(u16),
    /// Sound module
    SoundModule(SoundModule),
}

impl Setting {
    /// Field this setting changes
    #[must_use]
    pub fn field(&self) -> ConfigField {
        match self {
            Self::ServoDirections(_) | Self::ServoReversed { .. } => ConfigField::ServoDirections,
            Self::StartupSound(_) => ConfigField::StartupSound,
            Self::QuietMode(_) => ConfigField::QuietMode,
            Self::SlaveDelay(_) => ConfigField::SlaveDelay,
            Self::SoundModule(_) => ConfigField::SoundModule,
        }
    }

    fn apply_to(self, settings: &Settings) -> Result<Settings, ConfigStoreError> {
        let mut next = *settings;
        match self {
            Self::ServoDirections(mask) => next.servo_directions = mask,
            Self::ServoReversed { channel, reversed } => {
                if channel == 0 || channel > PANEL_COUNT {
                    return Err(ConfigStoreError::InvalidValue {
                        field: ConfigField::ServoDirections,
                        reason: format!("channel {channel} outside 1-{PANEL_COUNT}"),
                    });
                }
                let bit = 1u16 << (channel - 1);
                if reversed {
                    next.servo_directions |= bit;
                } else {
                    next.servo_directions &= !bit;
                }
            }
            Self::StartupSound(n) => next.startup_sound = n,
            Self::QuietMode(q) => next.quiet_mode = q,
            Self::SlaveDelay(ms) => next.slave_delay_ms = ms,
            Self::SoundModule(m) => next.sound_module = m,
        }
        next.validate()?;
        Ok(next)
    }

    /// Read the current value of `field` as a setting
    #[must_use]
    pub fn current(field: ConfigField, settings: &Settings) -> Self {
        match field {
            ConfigField::ServoDirections => Self::ServoDirections(settings.servo_directions),
            ConfigField::StartupSound => Self::StartupSound(settings.startup_sound),
            ConfigField::QuietMode => Self::QuietMode(settings.quiet_mode),
            ConfigField::SlaveDelay => Self::SlaveDelay(settings.slave_delay_ms),
            ConfigField::SoundModule => Self::SoundModule(settings.sound_module),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServoDirections(mask) => write!(f, "servo_directions={mask:#06x}"),
            Self::ServoReversed { channel, reversed } => {
                write!(f, "servo {channel} reversed={reversed}")
            }
            Self::StartupSound(n) => write!(f, "startup_sound={n}"),
            Self::QuietMode(q) => write!(f, "quiet_mode={q}"),
            Self::SlaveDelay(ms) => write!(f, "slave_delay_ms={ms}"),
            Self::SoundModule(m) => write!(f, "sound_module={m:?}"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Settings store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigStoreError {
    /// Persisted record failed its integrity check
    #[error("ConfigChecksumMismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// CRC read from storage
        stored: u32,
        /// CRC of the stored payload
        computed: u32,
    },

    /// Persisted record is structurally wrong
    #[error("ConfigChecksumMismatch: invalid record: {reason}")]
    InvalidRecord {
        /// What was wrong
        reason: String,
    },

    /// Rejected setting value
    #[error("ArgumentError: {field}: {reason}")]
    InvalidValue {
        /// Field being set
        field: ConfigField,
        /// Why it was rejected
        reason: String,
    },

    /// Storage read or write failed
    #[error("ConfigStorage: {operation} {location}: {message}")]
    Storage {
        /// `read` or `write`
        operation: &'static str,
        /// Storage description
        location: String,
        /// I/O error text
        message: String,
    },
}

// ============================================================================
// Storage
// ============================================================================

/// Where the settings record lives
pub trait ConfigStorage: Send + Sync {
    /// Human readable location for logs
    fn describe(&self) -> String;

    /// Read the record, `None` if nothing has been stored yet
    ///
    /// # Errors
    ///
    /// Any I/O error other than "not found".
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the record atomically
    ///
    /// # Errors
    ///
    /// Any I/O error; the previous record must remain intact.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
}

/// File-backed storage (temp file + rename)
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Storage at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileStorage {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// In-memory storage for tests and diskless setups
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bytes: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-filled with `bytes`
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current stored bytes
    #[must_use]
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.bytes.lock().clone()
    }
}

impl ConfigStorage for MemoryStorage {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().clone())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated write failure"));
        }
        *self.bytes.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

impl<T: ConfigStorage + ?Sized> ConfigStorage for std::sync::Arc<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }
}

// ============================================================================
// Store
// ============================================================================

/// How the last load went
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Valid record read
    Loaded,
    /// Nothing stored yet, defaults in use
    Missing,
    /// Record rejected, defaults in use
    Rejected(ConfigStoreError),
}

#[derive(Debug)]
struct StoreState {
    settings: Settings,
    dirty: bool,
}

/// Write-through settings store
pub struct ConfigStore {
    storage: Box<dyn ConfigStorage>,
    state: Mutex<StoreState>,
    outcome: LoadOutcome,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("storage", &self.storage.describe())
            .field("state", &*self.state.lock())
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl ConfigStore {
    /// Load settings from `storage`, falling back to defaults
    pub fn load(storage: impl ConfigStorage + 'static) -> Self {
        let location = storage.describe();
        let (settings, outcome) = match storage.read() {
            Ok(Some(bytes)) => match Settings::decode(&bytes) {
                Ok(settings) => {
                    tracing::info!(location = %location, "Loaded settings");
                    (settings, LoadOutcome::Loaded)
                }
                Err(e) => {
                    tracing::warn!(location = %location, error = %e, "Stored settings rejected, using defaults");
                    (Settings::default(), LoadOutcome::Rejected(e))
                }
            },
            Ok(None) => {
                tracing::info!(location = %location, "No stored settings, using defaults");
                (Settings::default(), LoadOutcome::Missing)
            }
            Err(e) => {
                let err = ConfigStoreError::Storage {
                    operation: "read",
                    location: location.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(location = %location, error = %err, "Settings unreadable, using defaults");
                (Settings::default(), LoadOutcome::Rejected(err))
            }
        };

        let dirty = outcome != LoadOutcome::Loaded;
        Self {
            storage: Box::new(storage),
            state: Mutex::new(StoreState { settings, dirty }),
            outcome,
        }
    }

    /// Store backed by memory, starting from defaults
    #[must_use]
    pub fn in_memory() -> Self {
        Self::load(MemoryStorage::new())
    }

    /// How the initial load went
    #[must_use]
    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.outcome
    }

    /// Current settings
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        self.state.lock().settings
    }

    /// Current value of one field
    #[must_use]
    pub fn get(&self, field: ConfigField) -> Setting {
        Setting::current(field, &self.state.lock().settings)
    }

    /// Whether memory differs from what is persisted
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Validate, apply and persist one setting
    ///
    /// The new value stays in effect even if persisting fails.
    ///
    /// # Errors
    ///
    /// `InvalidValue` leaves everything unchanged. `Storage` means the value
    /// was applied but not persisted; the store stays dirty.
    pub fn set(&self, setting: Setting) -> Result<Settings, ConfigStoreError> {
        let mut state = self.state.lock();
        let next = setting.apply_to(&state.settings)?;
        state.settings = next;
        state.dirty = true;
        tracing::info!(setting = %setting, "Setting changed");
        self.persist(&mut state)?;
        Ok(next)
    }

    /// Persist the current settings
    ///
    /// # Errors
    ///
    /// `Storage` if the write fails.
    pub fn save(&self) -> Result<(), ConfigStoreError> {
        let mut state = self.state.lock();
        self.persist(&mut state)
    }

    fn persist(&self, state: &mut StoreState) -> Result<(), ConfigStoreError> {
        match self.storage.write(&state.settings.encode()) {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(e) => {
                let err = ConfigStoreError::Storage {
                    operation: "write",
                    location: self.storage.describe(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "Settings not persisted");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_record_layout() {
        let settings = Settings {
            servo_directions: 0x0102,
            startup_sound: 2,
            quiet_mode: true,
            slave_delay_ms: 300,
            sound_module: SoundModule::DfPlayer,
        };
        let bytes = settings.encode();
        assert_eq!(&bytes[..9], &[b'S', 1, 0x02, 0x01, 2, 1, 0x2C, 0x01, 1]);
        assert_eq!(Settings::decode(&bytes), Ok(settings));
    }

    #[test]
    fn test_missing_storage_gives_dirty_defaults() {
        let store = ConfigStore::in_memory();
        assert_eq!(store.snapshot(), Settings::default());
        assert_eq!(store.load_outcome(), &LoadOutcome::Missing);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_corrupted_record_falls_back_to_defaults() {
        let mut bytes = Settings {
            startup_sound: 3,
            ..Settings::default()
        }
        .encode()
        .to_vec();
        bytes[4] ^= 0x01;

        let store = ConfigStore::load(MemoryStorage::with_bytes(bytes));
        assert_eq!(store.snapshot(), Settings::default());
        assert!(store.is_dirty());
        assert!(matches!(
            store.load_outcome(),
            LoadOutcome::Rejected(ConfigStoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let store = ConfigStore::load(MemoryStorage::with_bytes(vec![b'S', 1, 0]));
        assert!(matches!(
            store.load_outcome(),
            LoadOutcome::Rejected(ConfigStoreError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_set_persists_immediately() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ConfigStore::load(Arc::clone(&storage));

        store.set(Setting::QuietMode(true)).unwrap();
        assert!(!store.is_dirty());

        let reloaded = ConfigStore::load(Arc::clone(&storage));
        assert_eq!(reloaded.get(ConfigField::QuietMode), Setting::QuietMode(true));
        assert_eq!(reloaded.load_outcome(), &LoadOutcome::Loaded);
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_invalid_value_changes_nothing() {
        let store = ConfigStore::in_memory();
        let before = store.snapshot();
        assert!(matches!(
            store.set(Setting::SlaveDelay(10_001)),
            Err(ConfigStoreError::InvalidValue { .. })
        ));
        assert!(store.set(Setting::StartupSound(4)).is_err());
        assert!(store
            .set(Setting::ServoReversed {
                channel: 17,
                reversed: true
            })
            .is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_failed_write_keeps_value_and_dirty_flag() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ConfigStore::load(Arc::clone(&storage));
        storage.set_fail_writes(true);

        let result = store.set(Setting::StartupSound(0));
        assert!(matches!(result, Err(ConfigStoreError::Storage { .. })));
        assert_eq!(store.get(ConfigField::StartupSound), Setting::StartupSound(0));
        assert!(store.is_dirty());
        assert_eq!(storage.bytes(), None);

        storage.set_fail_writes(false);
        store.save().unwrap();
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_servo_reversed_flips_one_bit() {
        let store = ConfigStore::in_memory();
        store
            .set(Setting::ServoReversed {
                channel: 3,
                reversed: true,
            })
            .unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.servo_directions, 0b100);
        assert!(settings.is_reversed(3));
        assert!(!settings.is_reversed(2));

        store
            .set(Setting::ServoReversed {
                channel: 3,
                reversed: false,
            })
            .unwrap();
        assert_eq!(store.snapshot().servo_directions, 0);
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.bin");

        let store = ConfigStore::load(FileStorage::new(&path));
        assert_eq!(store.load_outcome(), &LoadOutcome::Missing);
        store.set(Setting::SoundModule(SoundModule::Vocalizer)).unwrap();

        assert_eq!(std::fs::read(&path).unwrap().len(), RECORD_LEN);
        assert!(!path.with_extension("tmp").exists());

        let reloaded = ConfigStore::load(FileStorage::new(&path));
        assert_eq!(reloaded.snapshot().sound_module, SoundModule::Vocalizer);
    }
}
