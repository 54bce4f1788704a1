use std::time::{Duration, SystemTime};

use reqwest::header::RETRY_AFTER;
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Unavailable,
    Conflict,
    NotFound,
    Transient,
    Permanent,
}

/// Client bound to a single web (site) of the document-library service.
#[derive(Clone)]
pub struct LibraryClient {
    http: Client,
    web_url: Url,
    token: String,
}

impl LibraryClient {
    pub fn new(web_url: &str, token: impl Into<String>) -> Result<Self, LibraryError> {
        Self::with_http(Client::new(), web_url, token)
    }

    pub fn with_http(
        http: Client,
        web_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, LibraryError> {
        let mut web_url = Url::parse(web_url)?;
        // Url::join drops the last segment unless the base ends with a slash.
        if !web_url.path().ends_with('/') {
            let path = format!("{}/", web_url.path());
            web_url.set_path(&path);
        }
        Ok(Self {
            http,
            web_url,
            token: token.into(),
        })
    }

    /// Same web and connection pool, different bearer token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            web_url: self.web_url.clone(),
            token: token.into(),
        }
    }

    pub fn web_url(&self) -> &Url {
        &self.web_url
    }

    pub async fn get_list_by_path(&self, server_relative_url: &str) -> Result<ListInfo, LibraryError> {
        let mut url = self.endpoint("_api/lists")?;
        url.query_pairs_mut()
            .append_pair("path", server_relative_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_items_page(
        &self,
        list_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ItemPage, LibraryError> {
        let mut url = self.endpoint(&format!("_api/lists/{list_id}/items"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.max(1).to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn folder_exists(&self, server_relative_url: &str) -> Result<bool, LibraryError> {
        let mut url = self.endpoint("_api/folders")?;
        url.query_pairs_mut()
            .append_pair("path", server_relative_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Creates a single folder. An existing folder is not an error.
    pub async fn create_folder(&self, server_relative_url: &str) -> Result<(), LibraryError> {
        let mut url = self.endpoint("_api/folders")?;
        url.query_pairs_mut()
            .append_pair("path", server_relative_url);
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    /// Returns the response with its body unread so callers can stream it.
    pub async fn download_file(&self, server_relative_url: &str) -> Result<Response, LibraryError> {
        let mut url = self.endpoint("_api/files/content")?;
        url.query_pairs_mut()
            .append_pair("path", server_relative_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn upload_file(
        &self,
        server_relative_url: &str,
        body: impl Into<Body>,
        overwrite: bool,
    ) -> Result<(), LibraryError> {
        let mut url = self.endpoint("_api/files/content")?;
        url.query_pairs_mut()
            .append_pair("path", server_relative_url)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_copy_job(
        &self,
        sources: &[String],
        destination: &str,
        options: &CopyJobOptions,
    ) -> Result<CopyJob, LibraryError> {
        let url = self.endpoint("_api/copy-jobs")?;
        let request = CopyJobRequest {
            sources,
            destination,
            options,
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_copy_job_status(&self, job_id: &str) -> Result<CopyJobStatus, LibraryError> {
        let url = self.endpoint(&format!("_api/copy-jobs/{job_id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, LibraryError> {
        Ok(self.web_url.join(path)?)
    }

    async fn check(response: Response) -> Result<Response, LibraryError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(LibraryError::Api {
            status,
            body,
            retry_after,
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, LibraryError> {
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl LibraryError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            LibraryError::Api { status, body, .. } => Some(classify_api_status(*status, body)),
            _ => None,
        }
    }

    /// 429 and 503: the service asked us to back off.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Unavailable)
        )
    }

    pub fn is_conflict(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Conflict)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LibraryError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        ApiErrorClass::Unavailable
    } else if status == StatusCode::CONFLICT || body.to_ascii_lowercase().contains("already exists")
    {
        ApiErrorClass::Conflict
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListInfo {
    pub id: String,
    pub title: String,
    /// Root folder of the list, e.g. `/sites/Files/Shared Documents`.
    pub server_relative_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListItem {
    pub server_relative_url: String,
    /// Parent folder, server-relative.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub editor: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ItemPage {
    pub items: Vec<ListItem>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NameConflictBehavior {
    Fail,
    Replace,
    KeepBoth,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CopyJobOptions {
    pub name_conflict: NameConflictBehavior,
    #[serde(default)]
    pub is_move: bool,
    #[serde(default)]
    pub exclude_children: bool,
    #[serde(default)]
    pub ignore_version_history: bool,
}

#[derive(Serialize)]
struct CopyJobRequest<'a> {
    sources: &'a [String],
    destination: &'a str,
    options: &'a CopyJobOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CopyJob {
    pub id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyJobState {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CopyJobStatus {
    pub state: CopyJobState,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_throttling_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            ApiErrorClass::Unavailable
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY, ""),
            ApiErrorClass::Transient
        );
    }

    #[test]
    fn already_exists_body_is_a_conflict() {
        assert_eq!(
            classify_api_status(
                StatusCode::BAD_REQUEST,
                "A file with the name Contoso.pptx already exists"
            ),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT, ""),
            ApiErrorClass::Conflict
        );
    }

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn past_http_date_means_no_wait() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
