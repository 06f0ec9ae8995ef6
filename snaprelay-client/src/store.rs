use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snaprelay_core::PairingCode;
use tracing::warn;

/// Upper bound on `pairing.json`; anything larger is treated as corrupt.
pub const MAX_PAIRING_STATE_BYTES: u64 = 64 * 1024;

/// Last successful pairing, persisted so the app can offer reconnect
/// affordances and auto-reconnect on focus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredPairing {
    pub code: PairingCode,
    pub connected_at_unix_ms: u64,
}

#[derive(Debug)]
pub enum PairingLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for PairingLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            PairingLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            PairingLoadError::Read(e) => write!(f, "read failed: {e}"),
            PairingLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for PairingLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PairingLoadError::Metadata(e) => Some(e),
            PairingLoadError::Read(e) => Some(e),
            PairingLoadError::Parse(e) => Some(e),
            PairingLoadError::TooLarge { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum PairingSaveError {
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for PairingSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            PairingSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            PairingSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for PairingSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PairingSaveError::Serialize(e) => Some(e),
            PairingSaveError::WriteTmp(e) => Some(e),
            PairingSaveError::Rename(e) => Some(e),
        }
    }
}

pub fn default_pairing_path() -> PathBuf {
    let base = std::env::var_os("SNAPRELAY_CONFIG_DIR")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("snaprelay");
    let _ = fs::create_dir_all(&dir);
    dir.join("pairing.json")
}

pub fn load_pairing_from_path(path: &Path) -> Result<StoredPairing, PairingLoadError> {
    let meta = fs::metadata(path).map_err(PairingLoadError::Metadata)?;
    if meta.len() > MAX_PAIRING_STATE_BYTES {
        return Err(PairingLoadError::TooLarge {
            size: meta.len(),
            max: MAX_PAIRING_STATE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(PairingLoadError::Read)?;
    serde_json::from_str(&data).map_err(PairingLoadError::Parse)
}

pub fn save_pairing_to_path(path: &Path, pairing: &StoredPairing) -> Result<(), PairingSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(pairing).map_err(PairingSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(PairingSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(PairingSaveError::Rename)?;
    Ok(())
}

/// Persists the last-used pairing code and connection timestamp at a fixed
/// path. Load failures are absorbed; save failures are retried with a short
/// doubling backoff before surfacing.
#[derive(Debug, Clone)]
pub struct PairingStore {
    path: PathBuf,
}

impl PairingStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(default_pairing_path())
    }

    pub fn load(&self) -> Option<StoredPairing> {
        match load_pairing_from_path(&self.path) {
            Ok(pairing) => Some(pairing),
            Err(PairingLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %self.path.display(), "pairing state unreadable: {err}");
                None
            }
        }
    }

    pub fn save(&self, code: &PairingCode, connected_at_unix_ms: u64) -> Result<(), PairingSaveError> {
        const MAX_ATTEMPTS: u32 = 3;
        const BACKOFF_BASE_MS: u64 = 50;

        let pairing = StoredPairing {
            code: code.clone(),
            connected_at_unix_ms,
        };

        let mut last_err: Option<PairingSaveError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match save_pairing_to_path(&self.path, &pairing) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt >= MAX_ATTEMPTS {
                        break;
                    }
                    let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
            }
        }

        Err(last_err.expect("retry loop sets last_err"))
    }

    pub fn clear(&self) {
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}
