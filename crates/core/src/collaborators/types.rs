//! Data exchanged with collaborators. ODM and license XML arrive already
//! parsed into these shapes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Parsed ODM order file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OdmContent {
    /// OverDrive media id.
    pub media_id: String,
    /// License acquisition endpoint.
    pub acquisition_url: String,
    /// Base URL the part filenames are relative to.
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub parts: Vec<Part>,
    pub metadata: AudioMetadata,
}

/// One audio part of a book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    pub number: u32,
    #[serde(default)]
    pub name: String,
    /// Path relative to [`OdmContent::base_url`].
    pub filename: String,
    /// Expected size in bytes.
    pub filesize: u64,
    #[serde(default)]
    pub duration: String,
}

/// Book metadata written into every part's tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub series: Vec<String>,
}

/// Acquired license.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct License {
    /// Client id the license was issued to; sent with every part request.
    pub client_id: String,
    /// Raw license document; sent with every part request.
    pub contents: String,
    /// Where the license was saved.
    pub path: PathBuf,
}

/// Which artwork an image download fetches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Cover,
    Thumbnail,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Cover => "cover",
            ImageKind::Thumbnail => "thumbnail",
        }
    }
}

/// Zero-padding width for part numbers: at least two digits.
pub fn part_number_width(part_count: usize) -> usize {
    if part_count < 10 {
        2
    } else {
        part_count.to_string().len()
    }
}

/// File name of a downloaded part: `<title>-part-<nn>.mp3`, lowercased,
/// restricted to `[a-z0-9.-]` with runs of separators collapsed.
pub fn part_file_name(title: &str, part_number: u32, width: usize) -> String {
    let raw = format!("{} - Part {:0width$}.mp3", title, part_number, width = width);
    let kept: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '.'))
        .collect();

    let mut name = String::with_capacity(kept.len());
    for c in kept.chars() {
        let c = if c == ' ' { '-' } else { c };
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }
    name
}

/// File name of a downloaded image: `<kind><ext>`, with the extension taken
/// from the URL path.
pub fn image_file_name(url: &str, kind: ImageKind) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let ext = last
        .rfind('.')
        .map(|i| &last[i..])
        .unwrap_or(".jpg");
    format!("{}{}", kind.as_str(), ext).to_lowercase()
}
