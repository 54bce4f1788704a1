use std::collections::{HashMap, HashSet};

use docshift_core::{LibraryClient, ListInfo};
use tokio::sync::Mutex;
use tracing::debug;

use super::error::MigrationError;
use super::paths::{self, PathError};
use super::throttle::Throttler;

/// Destination lists already looked up, keyed by server-relative root.
#[derive(Debug, Default)]
pub struct ListCache {
    lists: Mutex<HashMap<String, ListInfo>>,
}

impl ListCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        client: &LibraryClient,
        throttler: &Throttler,
        server_relative_url: &str,
    ) -> Result<ListInfo, MigrationError> {
        let mut lists = self.lists.lock().await;
        if let Some(list) = lists.get(server_relative_url) {
            return Ok(list.clone());
        }
        let list = throttler
            .run("get list", || client.get_list_by_path(server_relative_url))
            .await?;
        debug!(list = %list.title, url = server_relative_url, "destination list resolved");
        lists.insert(server_relative_url.to_string(), list.clone());
        Ok(list)
    }

    pub async fn clear(&self) {
        self.lists.lock().await.clear();
    }
}

/// Destination folders known to exist, as server-relative paths.
#[derive(Debug, Default)]
pub struct FolderCache {
    known: Mutex<HashSet<String>>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates every missing folder between `list_root` and `folder_path`,
    /// one segment at a time from the root down.
    pub async fn ensure_chain(
        &self,
        client: &LibraryClient,
        throttler: &Throttler,
        list_root: &str,
        folder_path: &str,
    ) -> Result<(), MigrationError> {
        let mut known = self.known.lock().await;
        if known.contains(folder_path) {
            return Ok(());
        }
        let segments = paths::segments_below(list_root, folder_path)
            .ok_or_else(|| PathError::InvalidFilePath(folder_path.to_string()))?;

        let mut current = list_root.trim_end_matches(paths::SEPARATOR).to_string();
        for segment in segments {
            current.push(paths::SEPARATOR);
            current.push_str(segment);
            if known.contains(&current) {
                continue;
            }
            throttler
                .run("create folder", || client.create_folder(&current))
                .await?;
            debug!(folder = %current, "destination folder ready");
            known.insert(current.clone());
        }
        known.insert(folder_path.to_string());
        Ok(())
    }

    pub async fn clear(&self) {
        self.known.lock().await.clear();
    }
}
