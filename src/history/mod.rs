//! Chain catalog, metadata and publishing.

mod catalog;
pub(crate) mod fetch;
mod metadata;
mod upload;

pub use catalog::{ChainCursor, ChainFilter, History, HistoryConfig, DEFAULT_CATALOG_URL};
pub use fetch::{fetch_cached_file, parse_http_date, FetchOutcome, HttpTransport, Transport};
pub use metadata::{archive_digest, ChainMetadata};
pub use upload::{
    interpret_upload_response, metadata_fields, UploadConfig, Uploader, API_KEY_ENV,
    API_KEY_HEADER,
};
