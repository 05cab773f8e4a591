//! Storage the array store is written through.
//!
//! Every protocol resolves to zarrs storage: a filesystem store, an
//! in-process memory store, or Azure Blob Storage through `object_store`.
//! Keys are `/`-separated and relative to the store root, e.g.
//! `time/zarr.json` or `air_temperature_at_2_metres/c/3/0/0`.

mod azure;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use zarrs::filesystem::FilesystemStore;
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{StoreKey, StorePrefix};

use crate::error::EtlError;

pub use azure::BlobPath;
pub use zarrs::storage::ReadableWritableListableStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    File,
    Abfs,
    Memory,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Abfs => "abfs",
            Protocol::Memory => "memory",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = EtlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" | "local" => Ok(Protocol::File),
            "abfs" | "az" => Ok(Protocol::Abfs),
            "memory" => Ok(Protocol::Memory),
            _ => Err(EtlError::InvalidProtocol(value.to_string())),
        }
    }
}

/// Connection options for a backend.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StorageOptions {
    pub account_name: Option<String>,
    pub credential: Option<String>,
}

impl fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageOptions")
            .field("account_name", &self.account_name)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StorageOptions {
    /// Parses `key=value` pairs as given on the command line.
    pub fn from_pairs(pairs: &[String]) -> Result<Self, EtlError> {
        let mut options = Self::default();
        for pair in pairs {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| EtlError::InvalidStorageOption(pair.clone()))?;
            match key.trim() {
                "account_name" => options.account_name = Some(value.trim().to_string()),
                "credential" => options.credential = Some(value.trim().to_string()),
                _ => return Err(EtlError::InvalidStorageOption(pair.clone())),
            }
        }
        Ok(options)
    }
}

/// Opens `path` with `protocol`. `memory` gives a fresh, empty store.
pub fn open_storage(
    protocol: Protocol,
    path: &str,
    options: &StorageOptions,
) -> Result<ReadableWritableListableStorage, EtlError> {
    match protocol {
        Protocol::File => {
            let store = FilesystemStore::new(path)
                .map_err(|err| EtlError::Filesystem(format!("{path}: {err}")))?;
            Ok(Arc::new(store))
        }
        Protocol::Memory => Ok(Arc::new(MemoryStore::new())),
        Protocol::Abfs => {
            let account = options.account_name.as_deref().ok_or_else(|| {
                EtlError::InvalidStorageOption("abfs requires account_name".to_string())
            })?;
            azure::open(account, path, options.credential.as_deref())
        }
    }
}

/// `<protocol>://<path>`, for logs and asset hrefs.
pub fn location(protocol: Protocol, path: &str) -> String {
    format!("{protocol}://{path}")
}

/// Joins `/`-separated key parts, skipping empty ones.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn store_key(key: &str) -> Result<StoreKey, EtlError> {
    StoreKey::new(key).map_err(|err| EtlError::Storage(format!("{key}: {err}")))
}

/// Prefix for the keys below `dir`; the empty string is the root.
pub fn store_prefix(dir: &str) -> Result<StorePrefix, EtlError> {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        return Ok(StorePrefix::root());
    }
    StorePrefix::new(format!("{dir}/")).map_err(|err| EtlError::Storage(format!("{dir}: {err}")))
}

pub(crate) fn storage_error(err: impl fmt::Display) -> EtlError {
    EtlError::Storage(err.to_string())
}
