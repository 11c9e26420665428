//! Anonymous peer identity
//!
//! A peer id looks like `peer-k3x9q2ab`. It is generated once and kept in
//! `<data_dir>/peer-id` so a restarted donor shows up under the same name.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::protocol::signal::validate_peer_id;

const ID_FILE: &str = "peer-id";
const ID_PREFIX: &str = "peer-";
const ID_LEN: usize = 8;
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A fresh random peer id
pub fn generate_peer_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let suffix: String = bytes
        .iter()
        .take(ID_LEN)
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();
    format!("{}{}", ID_PREFIX, suffix)
}

pub fn id_file(data_dir: &Path) -> PathBuf {
    data_dir.join(ID_FILE)
}

/// Load the persisted id from `data_dir`, creating one on first use
pub fn load_or_create(data_dir: &Path) -> Result<String> {
    let path = id_file(data_dir);

    if path.exists() {
        let stored = fs::read_to_string(&path).map_err(|e| Error::IoRead {
            path: path.clone(),
            source: e,
        })?;
        let id = stored.trim().to_string();
        validate_peer_id(&id)?;
        debug!(peer_id = %id, "Loaded peer id");
        return Ok(id);
    }

    fs::create_dir_all(data_dir).map_err(|e| Error::IoWrite {
        path: data_dir.to_path_buf(),
        source: e,
    })?;

    let id = generate_peer_id();
    fs::write(&path, format!("{}\n", id)).map_err(|e| Error::IoWrite {
        path: path.clone(),
        source: e,
    })?;

    info!(peer_id = %id, path = %path.display(), "Generated new peer id");
    Ok(id)
}

/// The id this process runs as: configured, else persisted
pub fn resolve(config: &PeerConfig) -> Result<String> {
    match &config.peer.id {
        Some(id) => {
            validate_peer_id(id)?;
            Ok(id.clone())
        }
        None => load_or_create(&config.data_dir()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_shape() {
        let id = generate_peer_id();
        assert!(id.starts_with("peer-"));
        assert_eq!(id.len(), ID_PREFIX.len() + ID_LEN);
        assert!(id[ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(validate_peer_id(&id).is_ok());
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    #[test]
    fn test_persisted_across_calls() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("nested");

        let first = load_or_create(&data_dir).unwrap();
        let second = load_or_create(&data_dir).unwrap();
        assert_eq!(first, second);
        assert!(id_file(&data_dir).exists());
    }

    #[test]
    fn test_corrupt_id_file_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(id_file(dir.path()), "bad~id").unwrap();
        assert!(load_or_create(dir.path()).is_err());
    }

    #[test]
    fn test_configured_id_wins() {
        let dir = TempDir::new().unwrap();
        let mut config = PeerConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().into_owned();
        config.peer.id = Some("peer-fixed001".into());

        assert_eq!(resolve(&config).unwrap(), "peer-fixed001");
        assert!(!id_file(dir.path()).exists());
    }
}
