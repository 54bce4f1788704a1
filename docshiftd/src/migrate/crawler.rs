use async_trait::async_trait;
use tracing::info;

use super::model::{CrawlPage, CrawlResult};

/// Source of paged listings for one list (document library).
#[async_trait]
pub trait ListLoader: Send + Sync {
    /// Opaque continuation handed back by the previous page.
    type Cursor: Send + Sync;
    type Error: Send;

    async fn get_page(
        &self,
        cursor: Option<Self::Cursor>,
        start_path: &str,
    ) -> Result<CrawlPage<Self::Cursor>, Self::Error>;
}

/// Follows continuation tokens until the loader reports the last page.
///
/// Errors from any page abort the crawl unchanged.
pub async fn crawl_all<L>(loader: &L, start_path: &str) -> Result<CrawlResult, L::Error>
where
    L: ListLoader + ?Sized,
{
    let mut result = CrawlResult::default();
    let mut cursor: Option<L::Cursor> = None;
    let mut pages = 0usize;
    let mut container = String::new();

    loop {
        let page = loader.get_page(cursor.take(), start_path).await?;
        pages += 1;
        info!(
            container = %page.container_title,
            page = pages,
            files = page.files.len(),
            folders = page.folders.len(),
            "crawled page"
        );
        result.files.extend(page.files);
        result.merge_folders(page.folders);
        container = page.container_title;

        match page.next_page_token {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    if pages > 1 {
        info!(
            container = %container,
            pages,
            files = result.files.len(),
            folders = result.folders.len(),
            "crawl finished"
        );
    }
    Ok(result)
}
