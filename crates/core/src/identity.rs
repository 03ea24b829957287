//! Machine identity advertised to the dispatcher.
//!
//! The machine ID comes from `/etc/machine-id`. The machine name is taken
//! from the configuration when set, otherwise from `/etc/hostname`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Where host identity facts are read from.
#[derive(Debug, Clone)]
pub struct IdentitySource {
    pub machine_id_path: PathBuf,
    pub hostname_path: PathBuf,
}

impl Default for IdentitySource {
    fn default() -> Self {
        Self {
            machine_id_path: PathBuf::from("/etc/machine-id"),
            hostname_path: PathBuf::from("/etc/hostname"),
        }
    }
}

/// Immutable identity of this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub machine_id: String,
    pub machine_name: String,
}

impl Identity {
    /// Resolve the identity from host files.
    ///
    /// `configured_name` wins over the hostname file when present.
    pub fn resolve(
        source: &IdentitySource,
        configured_name: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let machine_id = read_trimmed("machine ID", &source.machine_id_path)?;
        let machine_name = match configured_name {
            Some(name) => name.trim().to_string(),
            None => read_trimmed("hostname", &source.hostname_path)?,
        };
        Ok(Self {
            machine_id,
            machine_name,
        })
    }
}

/// Read a one-line host file, folding newlines and stripping whitespace.
fn read_trimmed(what: &'static str, path: &Path) -> Result<String, IdentityError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        what,
        path: path.to_path_buf(),
        source,
    })?;
    let value = normalize(&raw);
    if value.is_empty() {
        return Err(IdentityError::Empty {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(value)
}

fn normalize(raw: &str) -> String {
    raw.replace(['\n', '\r'], " ").trim().to_string()
}
