//! Signing key persistence.
//!
//! The Ed25519 seed lives in a single file as 64 hex characters. The file is
//! created on first start and never rewritten afterwards, so tokens survive
//! restarts. A malformed file is an error, not a reason to mint a new key.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use leash_auth::SigningKeys;

const SEED_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write key file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Load the signing key from `path`, generating and persisting one if the
/// file does not exist yet.
pub fn load_or_generate(path: impl AsRef<Path>) -> Result<SigningKeys, KeyFileError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let keys = parse_seed(path, &contents)?;
            info!(kid = keys.kid(), path = %path.display(), "loaded signing key");
            Ok(keys)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => generate(path),
        Err(source) => Err(KeyFileError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse_seed(path: &Path, contents: &str) -> Result<SigningKeys, KeyFileError> {
    let malformed = |reason: String| KeyFileError::Malformed {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = hex::decode(contents.trim()).map_err(|e| malformed(e.to_string()))?;
    let seed: [u8; SEED_LEN] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| malformed(format!("expected {SEED_LEN} bytes, found {}", b.len())))?;
    Ok(SigningKeys::from_seed(seed))
}

fn generate(path: &Path) -> Result<SigningKeys, KeyFileError> {
    let write_err = |source| KeyFileError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let keys = SigningKeys::generate();
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = match options.open(path) {
        Ok(file) => file,
        // Lost a race with another process; use whatever it wrote.
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "key file appeared concurrently, reloading");
            let contents = std::fs::read_to_string(path).map_err(|source| KeyFileError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            return parse_seed(path, &contents);
        }
        Err(err) => return Err(write_err(err)),
    };
    file.write_all(hex::encode(keys.seed()).as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;

    info!(kid = keys.kid(), path = %path.display(), "generated new signing key");
    Ok(keys)
}
