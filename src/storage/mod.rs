use std::path::Path;

use async_trait::async_trait;
use local::LocalStorage;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::tunneling::tunnel::TunnelError;

pub(crate) mod local;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite returned an error: {1}")]
    Sqlite(rusqlite::Error, String),
}

/// Known-host fingerprint store, keyed by `host:port`.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Storage: Send + Sync {
    async fn get_server_fingerprint(&self, address: &str) -> Result<Option<String>, StorageError>;
    async fn store_server_fingerprint(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError>;
    async fn ensure(&self) -> Result<(), StorageError>;
}

pub(crate) fn open_storage(db_path: &Path) -> Result<Box<dyn Storage>, StorageError> {
    Ok(Box::new(LocalStorage::open(db_path)?))
}

impl From<StorageError> for TunnelError {
    fn from(err: StorageError) -> Self {
        TunnelError::StorageLayer(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        let str_value = value.to_string();
        StorageError::Sqlite(value, str_value)
    }
}
