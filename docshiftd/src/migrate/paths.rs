use thiserror::Error;
use url::Url;

use super::model::{CopyRequest, FileRecord};

pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("path must start with '/': {0}")]
    MissingLeadingSeparator(String),
    #[error("path names no list: {0}")]
    NoContainer(String),
    #[error("invalid file path: {0}")]
    InvalidFilePath(String),
    #[error("invalid site url: {0}")]
    InvalidSiteUrl(String),
    #[error("{url} is outside {scope}")]
    OutOfScope { url: String, scope: String },
}

/// A folder path split into the list that holds it and the part below that list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPath {
    /// Full URL of the list root, e.g. `https://tenant.example/sites/Files/Shared Documents`.
    pub container_path: String,
    /// Path below the list root, without leading separator. Empty for the root itself.
    pub item_relative_path: String,
    pub is_folder: bool,
}

impl ItemPath {
    /// Server-relative form of [`container_path`](Self::container_path).
    pub fn container_server_relative(&self) -> Option<String> {
        web_relative_path(&self.container_path)
    }
}

/// Splits `relative_path` (site-relative, leading `/`) into list root and inner folder.
pub fn resolve(site_url: &str, relative_path: &str) -> Result<ItemPath, PathError> {
    if relative_path.is_empty() {
        return Err(PathError::Empty("relative path"));
    }
    if !relative_path.starts_with(SEPARATOR) {
        return Err(PathError::MissingLeadingSeparator(relative_path.to_string()));
    }

    let mut segments = relative_path.split(SEPARATOR).filter(|s| !s.is_empty());
    let container = segments
        .next()
        .ok_or_else(|| PathError::NoContainer(relative_path.to_string()))?;
    let rest: Vec<&str> = segments.collect();

    Ok(ItemPath {
        container_path: format!("{}/{}", site_url.trim_end_matches(SEPARATOR), container),
        item_relative_path: rest.join("/"),
        is_folder: true,
    })
}

/// Decoded URL path of `web_url` with no trailing separator; `""` for a root web.
pub fn web_relative_path(web_url: &str) -> Option<String> {
    let url = Url::parse(web_url).ok()?;
    if !url.has_host() {
        return None;
    }
    let decoded = urlencoding::decode(url.path()).ok()?;
    Some(decoded.trim_end_matches(SEPARATOR).to_string())
}

/// Joins a web URL and a server-relative path, overlapping the shared web path.
///
/// Degrades to `server_relative_path` when the web URL is unusable or the path
/// does not live under it.
pub fn full_url(web_url: &str, server_relative_path: &str) -> String {
    let web = web_url.trim_end_matches(SEPARATOR);
    match web_relative_path(web) {
        Some(web_path) => match server_relative_path.strip_prefix(web_path.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with(SEPARATOR) => format!("{web}{rest}"),
            _ => server_relative_path.to_string(),
        },
        None => server_relative_path.to_string(),
    }
}

/// True when the file's full URL lies at or below the request's source folder.
pub fn is_valid_for(file: &FileRecord, request: &CopyRequest) -> bool {
    is_within(&file.full_url(), &request.source_scope_url())
}

/// True when `site` is the tenant base address or a site below it.
pub fn is_within_tenant(site: &str, tenant_url: &str) -> bool {
    is_within(
        site.trim_end_matches(SEPARATOR),
        tenant_url.trim_end_matches(SEPARATOR),
    )
}

fn is_within(url: &str, scope: &str) -> bool {
    match url.strip_prefix(scope) {
        Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePathInfo {
    pub folder_path: String,
    pub file_name: String,
}

impl FilePathInfo {
    pub fn from_server_relative(path: &str) -> Result<Self, PathError> {
        if path.is_empty() || path.ends_with(SEPARATOR) {
            return Err(PathError::InvalidFilePath(path.to_string()));
        }
        let (folder, name) = path
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| PathError::InvalidFilePath(path.to_string()))?;
        Ok(Self {
            folder_path: folder.to_string(),
            file_name: name.to_string(),
        })
    }
}

/// Where a source file lands, expressed against the destination web.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFile {
    pub web_url: String,
    /// Server-relative root of the destination list.
    pub container_url: String,
    /// Server-relative folder the file goes into.
    pub folder_path: String,
    pub file_name: String,
}

impl DestinationFile {
    pub fn server_relative_path(&self) -> String {
        format!("{}/{}", self.folder_path, self.file_name)
    }

    pub fn with_file_name(&self, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..self.clone()
        }
    }
}

/// The file's path below the request's source folder, without leading separator.
fn path_below_source(file: &FileRecord, request: &CopyRequest) -> Result<String, PathError> {
    let url = file.full_url();
    let scope = request.source_scope_url();
    let below = url
        .strip_prefix(scope.as_str())
        .filter(|rest| rest.starts_with(SEPARATOR))
        .map(|rest| rest.trim_start_matches(SEPARATOR))
        .ok_or_else(|| PathError::OutOfScope {
            url: url.clone(),
            scope: scope.clone(),
        })?;
    if below.is_empty() {
        return Err(PathError::InvalidFilePath(url));
    }
    Ok(below.to_string())
}

/// Folder of `file` relative to the request's source folder; `""` when the file
/// sits directly in it. Both copy paths place files by this value.
pub fn source_subfolder(file: &FileRecord, request: &CopyRequest) -> Result<String, PathError> {
    let below = path_below_source(file, request)?;
    Ok(below
        .rsplit_once(SEPARATOR)
        .map(|(folder, _)| folder.to_string())
        .unwrap_or_default())
}

/// Re-parents a file from the source folder to the destination folder, keeping
/// the path below the source folder.
pub fn destination_for(file: &FileRecord, request: &CopyRequest) -> Result<DestinationFile, PathError> {
    let below = path_below_source(file, request)?;

    let dest_web = request.dest_site.trim_end_matches(SEPARATOR);
    let dest_web_path = web_relative_path(dest_web)
        .ok_or_else(|| PathError::InvalidSiteUrl(request.dest_site.clone()))?;
    let dest_item = resolve(&request.dest_site, &request.dest_path)?;
    let container_url = dest_item
        .container_server_relative()
        .ok_or_else(|| PathError::InvalidSiteUrl(request.dest_site.clone()))?;

    let target = format!(
        "{dest_web_path}{}/{below}",
        request.dest_path.trim_end_matches(SEPARATOR)
    );
    let info = FilePathInfo::from_server_relative(&target)?;

    Ok(DestinationFile {
        web_url: dest_web.to_string(),
        container_url,
        folder_path: info.folder_path,
        file_name: info.file_name,
    })
}

/// Server-relative destination folder for a bulk group.
pub fn bulk_destination_folder(request: &CopyRequest, subfolder: &str) -> Result<String, PathError> {
    let dest_web_path = web_relative_path(&request.dest_site)
        .ok_or_else(|| PathError::InvalidSiteUrl(request.dest_site.clone()))?;
    let base = format!(
        "{dest_web_path}{}",
        request.dest_path.trim_end_matches(SEPARATOR)
    );
    let subfolder = subfolder.trim_matches(SEPARATOR);
    if subfolder.is_empty() {
        Ok(base)
    } else {
        Ok(format!("{base}/{subfolder}"))
    }
}

/// Path segments of `folder_path` below `root`; `None` when it is not below it.
pub fn segments_below<'a>(root: &str, folder_path: &'a str) -> Option<Vec<&'a str>> {
    let root = root.trim_end_matches(SEPARATOR);
    let rest = folder_path.strip_prefix(root)?;
    if !(rest.is_empty() || rest.starts_with(SEPARATOR)) {
        return None;
    }
    Some(rest.split(SEPARATOR).filter(|s| !s.is_empty()).collect())
}
