// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::ConfigStore;

/// A config bag persisted as one JSON object on disk. Good enough for a
/// single-user desktop daemon; callers wanting the OS-sealed tier layer
/// [`super::seal::SecretSeal`] on top of the value this store returns.
pub(crate) struct File {
    path: PathBuf,
    lock: Mutex<()>,
}

impl File {
    pub(crate) fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        match fs::File::open(&self.path) {
            Ok(fp) => Ok(serde_json::from_reader(fp)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, data: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let fp = fs::File::create(&self.path)?;
        serde_json::to_writer(fp, data)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for File {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.read_all()?;
        data.insert(key.to_owned(), value.to_owned());
        self.write_all(&data)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.read_all()?;
        data.remove(key);
        self.write_all(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_across_instances() {
        let dir = std::env::temp_dir().join(format!(
            "keepassrpcd-test-{}",
            std::process::id()
        ));
        let path = dir.join("config.json");

        let store = File::new(&path);
        store.set("KeePassRPC.Key.alice", "xyz").await.unwrap();

        let reopened = File::new(&path);
        assert_eq!(
            reopened
                .get("KeePassRPC.Key.alice")
                .await
                .unwrap()
                .as_deref(),
            Some("xyz")
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
