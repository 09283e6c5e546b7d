//! The shapes returned to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::upstream::DriveFile;

/// Whether an entry is a folder or a regular file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Folder,
    File,
}

impl ItemType {
    pub fn of(file: &DriveFile) -> Self {
        if file.is_folder() {
            Self::Folder
        } else {
            Self::File
        }
    }
}

/// Metadata of a single file or folder.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Size in bytes, `0` for folders.
    pub size: u64,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub thumbnail_link: Option<String>,
    pub extension: Option<String>,
    #[serde(rename = "type")]
    pub ty: ItemType,
}

impl From<DriveFile> for FileInfo {
    fn from(file: DriveFile) -> Self {
        let ty = ItemType::of(&file);
        let size = file.size();
        Self {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            size,
            created_time: file.created_time,
            modified_time: file.modified_time,
            thumbnail_link: file.thumbnail_link,
            extension: file.file_extension,
            ty,
        }
    }
}

impl FileInfo {
    pub fn is_folder(&self) -> bool {
        self.ty == ItemType::Folder
    }
}

/// An entry of a listing or search page.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListedItem {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Size in bytes, `0` for folders.
    pub size: u64,
    /// Human readable size, see [`human_size`].
    pub human_size: String,
    /// The listed folder, not set for search results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_folder_id: Option<String>,
    #[serde(rename = "type")]
    pub ty: ItemType,
}

/// Totals of a page, and the token of the next page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PageInfo {
    pub total_files: usize,
    pub total_folders: usize,
    /// Sum of the sizes of all files of the page, in bytes.
    pub total_files_size: u64,
    pub page_token: Option<String>,
}

impl PageInfo {
    /// Counts `file` towards the totals.
    pub fn add(&mut self, ty: ItemType, size: u64) {
        match ty {
            ItemType::Folder => self.total_folders += 1,
            ItemType::File => {
                self.total_files += 1;
                self.total_files_size += size;
            }
        }
    }
}

/// One page of a listing or search.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Page {
    pub files: Vec<ListedItem>,
    pub page_info: PageInfo,
}

/// Download statistics of a single file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FileStats {
    pub file_id: String,
    pub download_count: u64,
    pub trending_score: f64,
    pub hotness_score: f64,
    pub first_download: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
}

/// Formats a byte count with binary units, e.g. `1.5 GB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{size:.2}");
    let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{formatted} {}", UNITS[unit])
}
