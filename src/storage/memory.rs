// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

use super::ConfigStore;

/// A process-lifetime-only config bag. Used for Tier 0/3 key containers and
/// for tests; nothing written here survives a restart.
pub(crate) struct Memory {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl Memory {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ConfigStore for Memory {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_value() {
        let store = Memory::new();
        store.set("KeePassRPC.Key.alice", "xyz").await.unwrap();
        assert_eq!(
            store.get("KeePassRPC.Key.alice").await.unwrap().as_deref(),
            Some("xyz")
        );
        store.remove("KeePassRPC.Key.alice").await.unwrap();
        assert_eq!(store.get("KeePassRPC.Key.alice").await.unwrap(), None);
    }
}
