use std::future::Future;
use std::sync::Arc;

use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::prefix::PrefixStore;
use tokio::runtime::Runtime;
use tracing::debug;
use zarrs::storage::ReadableWritableListableStorage;
use zarrs::storage::storage_adapter::async_to_sync::{
    AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};
use zarrs_object_store::AsyncObjectStore;

use crate::error::EtlError;

/// An abfs store path, `<container>/<prefix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPath {
    pub container: String,
    pub prefix: String,
}

impl BlobPath {
    pub fn parse(path: &str) -> Result<Self, EtlError> {
        let path = path.trim_start_matches("abfs://").trim_matches('/');
        let (container, prefix) = match path.split_once('/') {
            Some((container, prefix)) => (container, prefix),
            None => (path, ""),
        };
        if container.is_empty() {
            return Err(EtlError::InvalidStorageOption(format!(
                "abfs path '{path}' has no container"
            )));
        }
        Ok(Self {
            container: container.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }
}

/// Drives the object store's futures on a runtime owned by the storage.
struct TokioBlockOn(Runtime);

impl AsyncToSyncBlockOn for TokioBlockOn {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.0.block_on(future)
    }
}

/// Blob container storage for `path`, authenticated with a SAS token when
/// one is given.
pub(super) fn open(
    account: &str,
    path: &str,
    sas: Option<&str>,
) -> Result<ReadableWritableListableStorage, EtlError> {
    let blob = BlobPath::parse(path)?;
    let mut builder = MicrosoftAzureBuilder::new()
        .with_account(account)
        .with_container_name(&blob.container);
    if let Some(sas) = sas.map(|token| token.trim_start_matches('?')).filter(|token| !token.is_empty()) {
        builder = builder.with_config(AzureConfigKey::SasKey, sas);
    }
    let container = builder
        .build()
        .map_err(|err| EtlError::InvalidStorageOption(err.to_string()))?;
    let runtime = Runtime::new().map_err(|err| EtlError::Storage(err.to_string()))?;
    debug!("opened container {} under {account}", blob.container);

    let store = AsyncObjectStore::new(PrefixStore::new(container, blob.prefix.as_str()));
    Ok(Arc::new(AsyncToSyncStorageAdapter::new(
        Arc::new(store),
        TokioBlockOn(runtime),
    )))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn splits_container_and_prefix() {
        let path = BlobPath::parse("abfs://era5/forecast.zarr/").unwrap();
        assert_eq!(path.container, "era5");
        assert_eq!(path.prefix, "forecast.zarr");
        assert_eq!(BlobPath::parse("era5").unwrap().prefix, "");
        assert_matches!(BlobPath::parse("/"), Err(EtlError::InvalidStorageOption(_)));
    }

    #[test]
    fn opens_without_contacting_the_account() {
        let storage = open("cpdataeuwest", "era5/forecast.zarr", Some("?sv=2020-08-04&sig=abc"));
        assert!(storage.is_ok());
    }
}
