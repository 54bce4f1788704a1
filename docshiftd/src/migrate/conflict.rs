use std::future::Future;

use tracing::warn;

use super::error::MigrationError;
use super::model::ConflictPolicy;
use super::paths::DestinationFile;

/// Upper bound on `name_N` candidates tried before the item is given up on.
pub const MAX_RENAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    Fail,
    RetryAs(String),
}

pub fn resolve_conflict(policy: ConflictPolicy, original_name: &str, attempt: u32) -> ConflictDecision {
    match policy {
        ConflictPolicy::Rename if attempt <= MAX_RENAME_ATTEMPTS => {
            ConflictDecision::RetryAs(numbered_name(original_name, attempt))
        }
        _ => ConflictDecision::Fail,
    }
}

/// `report.docx` -> `report_2.docx`. Always derived from the original name.
pub fn numbered_name(name: &str, n: u32) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem}_{n}.{ext}");
    }

    format!("{name}_{n}")
}

/// Uploads to `target`, probing `name_1`, `name_2`, ... while the destination
/// reports a conflict and the policy is [`ConflictPolicy::Rename`].
///
/// Returns the server-relative path actually written.
pub async fn upload_with_policy<F, Fut>(
    target: &DestinationFile,
    policy: ConflictPolicy,
    mut upload: F,
) -> Result<String, MigrationError>
where
    F: FnMut(String, bool) -> Fut,
    Fut: Future<Output = Result<(), MigrationError>>,
{
    let overwrite = policy.overwrites();
    let mut current = target.clone();
    let mut attempt = 0;

    loop {
        let path = current.server_relative_path();
        match upload(path.clone(), overwrite).await {
            Ok(()) => return Ok(path),
            Err(err) if err.is_conflict() => {
                attempt += 1;
                match resolve_conflict(policy, &target.file_name, attempt) {
                    ConflictDecision::RetryAs(name) => {
                        warn!(existing = %path, next = %name, "destination name taken; renaming");
                        current = target.with_file_name(name);
                    }
                    ConflictDecision::Fail => return Err(MigrationError::Conflict { path }),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
