//! Listing folders and searching the drive.
//!
//! Pages are cached in a [`MemoCache`] keyed by the folder or search query, the page token and
//! the page size. Entries of a page are resolved in concurrent batches, shortcuts are replaced
//! by the file they point to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::caching::MemoCache;
use crate::config::ListingConfig;
use crate::error::DriveError;
use crate::types::{FileInfo, ItemType, ListedItem, Page, PageInfo, human_size};
use crate::upstream::{DriveApi, DriveFile, FileList, FilesQuery, SHORTCUT_MIME_TYPE};

/// Mime types never returned by searches, as they cannot be downloaded.
const EXCLUDED_MIME_TYPES: &[&str] = &[
    SHORTCUT_MIME_TYPE,
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.site",
];

const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, size, shortcutDetails)";
const SEARCH_FIELDS: &str = "nextPageToken, files(id, driveId, name, mimeType, size, modifiedTime)";

/// Escapes a value embedded into a single-quoted query string.
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Builds the query listing the direct children of a folder.
pub fn children_query(folder_id: &str, page_token: Option<String>, page_size: u32) -> FilesQuery {
    FilesQuery {
        q: format!("'{}' in parents and trashed = false", escape(folder_id)),
        fields: LIST_FIELDS,
        order_by: "folder, name",
        page_size,
        page_token,
        all_drives: false,
    }
}

/// Builds the query searching all drives for files whose name contains every word of `query`.
///
/// Returns `None` if the query has no words.
pub fn search_query(query: &str, page_token: Option<String>, page_size: u32) -> Option<FilesQuery> {
    let query = escape(query.trim());
    let words: Vec<_> = query
        .split_whitespace()
        .map(|word| format!("name contains '{word}'"))
        .collect();
    if words.is_empty() {
        return None;
    }

    let mut q = String::from("trashed = false");
    for mime_type in EXCLUDED_MIME_TYPES {
        q.push_str(&format!(" AND mimeType != '{mime_type}'"));
    }
    q.push_str(" AND name != '.password'");
    q.push_str(&format!(" AND ({})", words.join(" AND ")));

    Some(FilesQuery {
        q,
        fields: SEARCH_FIELDS,
        order_by: "folder, name, modifiedTime desc",
        page_size,
        page_token,
        all_drives: true,
    })
}

/// Runs `f` on all `items`, `batch_size` items at a time.
///
/// The items of a batch are processed concurrently, the output keeps the order of the input.
pub async fn process_in_batches<T, U, F, Fut>(items: Vec<T>, batch_size: usize, mut f: F) -> Vec<U>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = U>,
{
    let batch_size = batch_size.max(1);
    let mut output = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let batch: Vec<_> = items.by_ref().take(batch_size).map(&mut f).collect();
        output.extend(futures::future::join_all(batch).await);
    }

    output
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Source {
    Folder(String),
    Search(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PageKey {
    source: Source,
    page_token: Option<String>,
    page_size: u32,
}

type InfoCache = MemoCache<String, Arc<FileInfo>, DriveError>;

/// Looks up file metadata through the metadata cache.
#[derive(Clone, Debug)]
struct Lookup {
    api: Arc<DriveApi>,
    info: Arc<InfoCache>,
    info_ttl: Duration,
    batch_size: usize,
}

impl Lookup {
    async fn file_info(&self, file_id: &str) -> Result<Arc<FileInfo>, DriveError> {
        let api = Arc::clone(&self.api);
        let key = file_id.to_owned();
        let file_id = key.clone();
        self.info
            .get_or_compute(key, self.info_ttl, move || async move {
                let file = api.get_file(&file_id).await?;
                Ok(Arc::new(FileInfo::from(file)))
            })
            .await
    }

    /// Turns a listed file into a page entry, following shortcuts.
    ///
    /// Returns `None` for shortcuts whose target no longer exists.
    async fn resolve(
        &self,
        file: DriveFile,
        parent: Option<&str>,
    ) -> Result<Option<ListedItem>, DriveError> {
        let (id, name, mime_type, size, ty) = match file.shortcut_details {
            Some(ref shortcut) => match self.file_info(&shortcut.target_id).await {
                Ok(target) => (
                    target.id.clone(),
                    target.name.clone(),
                    target.mime_type.clone(),
                    target.size,
                    target.ty,
                ),
                Err(DriveError::NotFound) => {
                    tracing::warn!(
                        shortcut = %file.id,
                        target = %shortcut.target_id,
                        "shortcut target not found"
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err),
            },
            None => {
                let size = file.size();
                let ty = ItemType::of(&file);
                (file.id, file.name, file.mime_type, size, ty)
            }
        };

        let item = ListedItem {
            id,
            name,
            mime_type,
            size,
            human_size: human_size(size),
            parent_folder_id: parent.map(str::to_owned),
            ty,
        };
        Ok(Some(item))
    }

    async fn build_page(&self, list: FileList, parent: Option<&str>) -> Result<Page, DriveError> {
        let resolved =
            process_in_batches(list.files, self.batch_size, |file| self.resolve(file, parent))
                .await;

        let mut page = Page {
            files: Vec::with_capacity(resolved.len()),
            page_info: PageInfo {
                page_token: list.next_page_token,
                ..Default::default()
            },
        };
        for entry in resolved {
            if let Some(item) = entry? {
                page.page_info.add(item.ty, item.size);
                page.files.push(item);
            }
        }
        Ok(page)
    }
}

/// Cached listings, searches and metadata lookups.
#[derive(Debug)]
pub struct Catalog {
    lookup: Lookup,
    pages: MemoCache<PageKey, Arc<Page>, DriveError>,
    ttl: Duration,
}

impl Catalog {
    pub fn new(api: Arc<DriveApi>, config: &ListingConfig) -> Self {
        let mut pages = MemoCache::new("listing.pages");
        if let Some(limit) = config.max_concurrent {
            pages = pages.with_concurrency_limit(limit);
        }

        Self {
            lookup: Lookup {
                api,
                info: Arc::new(MemoCache::new("listing.info")),
                info_ttl: config.info_ttl,
                batch_size: config.batch_size,
            },
            pages,
            ttl: config.ttl,
        }
    }

    /// Returns the metadata of a file or folder.
    pub async fn file_info(&self, file_id: &str) -> Result<Arc<FileInfo>, DriveError> {
        self.lookup.file_info(file_id.trim()).await
    }

    /// Lists a page of the direct children of a folder.
    pub async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<Arc<Page>, DriveError> {
        let query = children_query(folder_id, page_token.clone(), page_size);
        let key = PageKey {
            source: Source::Folder(folder_id.to_owned()),
            page_token,
            page_size,
        };

        let lookup = self.lookup.clone();
        let parent = folder_id.to_owned();
        self.pages
            .get_or_compute(key, self.ttl, move || async move {
                let list = lookup.api.list_files(&query).await.inspect_err(|err| {
                    tracing::warn!(folder_id = %parent, error = %err, "failed to list folder");
                })?;
                lookup.build_page(list, Some(&parent)).await.map(Arc::new)
            })
            .await
    }

    /// Searches all drives for files whose name contains every word of `query`.
    ///
    /// An empty query yields an empty page without asking upstream.
    pub async fn search(
        &self,
        query: &str,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<Arc<Page>, DriveError> {
        let Some(files_query) = search_query(query, page_token.clone(), page_size) else {
            return Ok(Arc::default());
        };
        let key = PageKey {
            source: Source::Search(query.trim().to_owned()),
            page_token,
            page_size,
        };

        let lookup = self.lookup.clone();
        self.pages
            .get_or_compute(key, self.ttl, move || async move {
                let list = lookup.api.list_files(&files_query).await?;
                lookup.build_page(list, None).await.map(Arc::new)
            })
            .await
    }
}
