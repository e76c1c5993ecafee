//! Testing utilities and mock implementations.
//!
//! The mocks stand in for the collaborators so whole workflows can run
//! in-process against an in-memory store and the local bus.
//!
//! # Example
//!
//! ```rust,ignore
//! use abd_core::testing::{MockLicenseClient, MockMediaFetcher, MockTranscoder};
//!
//! let fetcher = MockMediaFetcher::new();
//! fetcher.fail_part(2, "connection reset").await;
//!
//! // Build the downloader routes with Arc::new(fetcher)...
//! ```

mod mock_license;
mod mock_media_fetcher;
mod mock_transcoder;
mod recording_bus;

pub use mock_license::MockLicenseClient;
pub use mock_media_fetcher::{MockMediaFetcher, RecordedFetch};
pub use mock_transcoder::{MockTranscoder, RecordedTranscode};
pub use recording_bus::{RecordedMessage, RecordingBus};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::collaborators::{AudioMetadata, OdmContent, Part};

    /// A parsed ODM order with `parts` audio parts and a cover image.
    pub fn odm(title: &str, parts: u32) -> OdmContent {
        OdmContent {
            media_id: format!("media-{}", title.to_lowercase().replace(' ', "-")),
            acquisition_url: "https://license.example.com/acquire".to_string(),
            base_url: "https://cdn.example.com/book".to_string(),
            cover_url: Some("https://img.example.com/cover.jpg".to_string()),
            thumbnail_url: None,
            parts: (1..=parts).map(part).collect(),
            metadata: AudioMetadata {
                title: title.to_string(),
                authors: vec!["J. R. R. Tolkien".to_string()],
                narrators: vec!["Andy Serkis".to_string()],
                publisher: Some("Recorded Books".to_string()),
                genres: vec!["Fantasy".to_string()],
                languages: vec!["English".to_string()],
                ..AudioMetadata::default()
            },
        }
    }

    /// One audio part of roughly ten megabytes.
    pub fn part(number: u32) -> Part {
        Part {
            number,
            name: format!("Part {}", number),
            filename: format!("Book-Part{:02}.mp3", number),
            filesize: 10 * 1024 * 1024,
            duration: "01:00:00".to_string(),
        }
    }
}
