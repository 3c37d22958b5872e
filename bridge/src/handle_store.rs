// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Record of which handle transaction served which request transaction.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use ethers::types::H256;
use rocksdb::{Options, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

pub const HANDLE_TX_STORE_DIR_NAME: &str = "handle_tx_db";

#[async_trait]
pub trait HandleTxStore: Send + Sync {
    async fn write_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: H256,
        handle_tx_hash: H256,
    ) -> BridgeResult<()>;

    async fn read_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: &H256,
    ) -> BridgeResult<Option<H256>>;
}

#[derive(Debug, Default)]
pub struct InMemoryHandleTxStore {
    hashes: RwLock<HashMap<H256, H256>>,
}

impl InMemoryHandleTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hashes.read().map(|h| h.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HandleTxStore for InMemoryHandleTxStore {
    async fn write_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: H256,
        handle_tx_hash: H256,
    ) -> BridgeResult<()> {
        self.hashes
            .write()
            .map_err(|e| BridgeError::StorageError(e.to_string()))?
            .insert(request_tx_hash, handle_tx_hash);
        Ok(())
    }

    async fn read_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: &H256,
    ) -> BridgeResult<Option<H256>> {
        Ok(self
            .hashes
            .read()
            .map_err(|e| BridgeError::StorageError(e.to_string()))?
            .get(request_tx_hash)
            .copied())
    }
}

/// RocksDB store keyed by request tx hash. Disk access runs on the blocking
/// pool.
pub struct RocksDbHandleTxStore {
    path: PathBuf,
    db: Arc<DB>,
}

impl RocksDbHandleTxStore {
    pub fn open(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)
            .map_err(|e| BridgeError::StorageError(format!("{:?}: {}", path, e)))?;
        Ok(Self {
            path,
            db: Arc::new(db),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> BridgeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T, rocksdb::Error> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| BridgeError::StorageError(e.to_string()))?
            .map_err(|e| BridgeError::StorageError(e.to_string()))
    }
}

#[async_trait]
impl HandleTxStore for RocksDbHandleTxStore {
    async fn write_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: H256,
        handle_tx_hash: H256,
    ) -> BridgeResult<()> {
        self.blocking(move |db| db.put(request_tx_hash.as_bytes(), handle_tx_hash.as_bytes()))
            .await?;
        debug!(
            "Stored handle tx {:?} for request tx {:?}",
            handle_tx_hash, request_tx_hash
        );
        Ok(())
    }

    async fn read_handle_tx_hash_from_request_tx_hash(
        &self,
        request_tx_hash: &H256,
    ) -> BridgeResult<Option<H256>> {
        let key = *request_tx_hash;
        let value = self.blocking(move |db| db.get(key.as_bytes())).await?;
        match value {
            None => Ok(None),
            Some(bytes) if bytes.len() == H256::len_bytes() => Ok(Some(H256::from_slice(&bytes))),
            Some(bytes) => Err(BridgeError::StorageError(format!(
                "corrupt handle tx hash of {:?}: {} bytes",
                key,
                bytes.len()
            ))),
        }
    }
}
