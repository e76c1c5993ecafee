//! Boundary with the outside world: license server, media CDN and ffmpeg.
//!
//! Workflows only see the traits; production implementations live in
//! [`http`] and [`ffmpeg`], test doubles in [`crate::testing`].

pub mod ffmpeg;
pub mod http;
mod traits;
mod types;

pub use crate::dispatch::ExternalError;
pub use ffmpeg::FfmpegTranscoder;
pub use http::{HttpLicenseClient, HttpMediaFetcher};
pub use traits::{LicenseClient, MediaFetcher, Transcoder};
pub use types::*;
