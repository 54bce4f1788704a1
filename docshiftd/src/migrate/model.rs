use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::paths::{self, PathError};

/// What to do when the destination already holds a file with the same name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    #[default]
    #[serde(alias = "FailAction", alias = "fail")]
    Fail,
    #[serde(
        alias = "NewDestinationName",
        alias = "NewDesintationName",
        alias = "rename"
    )]
    Rename,
    #[serde(alias = "replace")]
    Replace,
}

impl ConflictPolicy {
    pub fn overwrites(self) -> bool {
        self == ConflictPolicy::Replace
    }
}

/// A copy of one folder tree between two document libraries.
///
/// Field names on the wire follow the public `POST /copy` body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyRequest {
    #[serde(rename = "currentSite")]
    pub source_site: String,
    #[serde(rename = "relativeUrlToCopy")]
    pub source_path: String,
    #[serde(rename = "destinationSite")]
    pub dest_site: String,
    #[serde(rename = "relativeUrlDestination")]
    pub dest_path: String,
    #[serde(rename = "conflictResolution", default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(rename = "deleteAfterCopy", default)]
    pub delete_after_copy: bool,
}

impl CopyRequest {
    pub fn validate(&self) -> Result<(), PathError> {
        require_non_empty("currentSite", &self.source_site)?;
        require_non_empty("relativeUrlToCopy", &self.source_path)?;
        require_non_empty("destinationSite", &self.dest_site)?;
        require_non_empty("relativeUrlDestination", &self.dest_path)?;
        paths::resolve(&self.source_site, &self.source_path)?;
        paths::resolve(&self.dest_site, &self.dest_path)?;
        Ok(())
    }

    /// Full URL of the folder being copied, without a trailing separator.
    pub fn source_scope_url(&self) -> String {
        format!(
            "{}{}",
            self.source_site.trim_end_matches('/'),
            self.source_path.trim_end_matches('/')
        )
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), PathError> {
    if value.trim().is_empty() {
        return Err(PathError::Empty(field));
    }
    Ok(())
}

/// The list (document library) a file was found in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    pub title: String,
    pub server_relative_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRecord {
    /// e.g. `https://tenant.example/sites/Files`
    pub site_url: String,
    /// e.g. `https://tenant.example/sites/Files/subsite`
    pub web_url: String,
    /// e.g. `/sites/Files/subsite/Shared Documents/Contoso.pptx`
    pub server_relative_path: String,
    pub container: ContainerRef,
    /// Folder below the container root. Never starts or ends with a separator.
    #[serde(default)]
    pub subfolder: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl FileRecord {
    pub fn full_url(&self) -> String {
        paths::full_url(&self.web_url, &self.server_relative_path)
    }

    pub fn is_valid(&self) -> bool {
        !self.server_relative_path.is_empty()
            && !self.site_url.is_empty()
            && !self.web_url.is_empty()
            && !self.container.server_relative_url.is_empty()
            && self.last_modified.is_some()
            && self.web_url.starts_with(self.site_url.trim_end_matches('/'))
            && self.full_url().starts_with(self.web_url.trim_end_matches('/'))
            && valid_subfolder(&self.subfolder)
    }

    pub fn file_name(&self) -> &str {
        self.server_relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.server_relative_path)
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.server_relative_path)
    }
}

fn valid_subfolder(subfolder: &str) -> bool {
    subfolder.is_empty()
        || (!subfolder.starts_with('/') && !subfolder.ends_with('/') && !subfolder.contains("//"))
}

/// One page from a [`ListLoader`](super::crawler::ListLoader).
#[derive(Debug, Clone)]
pub struct CrawlPage<C> {
    pub container_title: String,
    pub files: Vec<FileRecord>,
    pub folders: Vec<String>,
    pub next_page_token: Option<C>,
}

impl<C> CrawlPage<C> {
    pub fn last(container_title: impl Into<String>) -> Self {
        Self {
            container_title: container_title.into(),
            files: Vec::new(),
            folders: Vec::new(),
            next_page_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlResult {
    pub files: Vec<FileRecord>,
    /// Unique, in first-seen order.
    pub folders: Vec<String>,
}

impl CrawlResult {
    pub fn merge_folders(&mut self, found: Vec<String>) {
        for folder in found {
            if !self.folders.contains(&folder) {
                self.folders.push(folder);
            }
        }
    }
}

/// Files that need per-file transfer, plus the request they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub request: CopyRequest,
    pub items: Vec<FileRecord>,
}

impl CopyBatch {
    pub fn is_valid(&self) -> bool {
        !self.items.is_empty() && self.request.validate().is_ok()
    }
}

/// Source URLs a provider-side copy job moves into one destination folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCopyBatch {
    pub request: CopyRequest,
    /// Destination folder below `request.dest_path`; empty for the root.
    pub subfolder: String,
    pub source_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncStartCopy {
    pub start: CopyRequest,
    pub request_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    CopyBatch(CopyBatch),
    StartCopy(AsyncStartCopy),
}

impl QueueMessage {
    /// Tries each message shape in turn; `None` when neither fits.
    pub fn parse(body: &str) -> Option<Self> {
        if let Ok(batch) = serde_json::from_str::<CopyBatch>(body) {
            return Some(QueueMessage::CopyBatch(batch));
        }
        serde_json::from_str::<AsyncStartCopy>(body)
            .ok()
            .map(QueueMessage::StartCopy)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            QueueMessage::CopyBatch(batch) => serde_json::to_string(batch),
            QueueMessage::StartCopy(start) => serde_json::to_string(start),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub source: String,
    pub destination: String,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn request(source_path: &str, dest_path: &str, policy: ConflictPolicy) -> CopyRequest {
        CopyRequest {
            source_site: "https://tenant.example/sites/Files".into(),
            source_path: source_path.into(),
            dest_site: "https://tenant.example/sites/Files".into(),
            dest_path: dest_path.into(),
            conflict_policy: policy,
            delete_after_copy: false,
        }
    }

    pub fn file(server_relative_path: &str, subfolder: &str, size_bytes: u64) -> FileRecord {
        FileRecord {
            site_url: "https://tenant.example/sites/Files".into(),
            web_url: "https://tenant.example/sites/Files".into(),
            server_relative_path: server_relative_path.into(),
            container: ContainerRef {
                title: "Documents".into(),
                server_relative_url: "/sites/Files/Shared Documents".into(),
            },
            subfolder: subfolder.into(),
            author: "jane@contoso.example".into(),
            last_modified: Some(OffsetDateTime::UNIX_EPOCH),
            size_bytes,
            drive_id: None,
            item_id: None,
        }
    }
}
