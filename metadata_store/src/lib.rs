//! Structured records for images and the user metadata attached to them.
//!
//! Two backends implement [`MetadataStore`]: an in-memory map used by tests
//! and single-process deployments, and RocksDB. Both evaluate searches with
//! [`ImageQuery::select`] so that ordering and pagination agree across
//! backends; the conformance tests at the bottom of this file run against
//! each of them.

pub mod memory;
pub mod rocksdb;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_model::{Image, ImageDocument, ImageQuery, MetadataRecord, MimeType};
pub use crate::memory::MemoryMetadataStore;
pub use crate::rocksdb::RocksDBMetadataStore;

pub const SAVE_IMAGE_FAILED: &str = "Unable to save image data";
pub const DELETE_IMAGE_FAILED: &str = "Unable to delete image data";
pub const FETCH_IMAGE_FAILED: &str = "Unable to fetch image data";
pub const UPDATE_METADATA_FAILED: &str = "Unable to update meta data";
pub const FETCH_METADATA_FAILED: &str = "Unable to fetch meta data";
pub const DELETE_METADATA_FAILED: &str = "Unable to delete meta data";
pub const SEARCH_FAILED: &str = "Unable to search for images";
pub const FETCH_INFO_FAILED: &str = "Unable to fetch information from the database";
pub const FETCH_MIME_TYPE_FAILED: &str = "Unable to fetch image meta data";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Image not found")]
    ImageNotFound,

    /// A backend failure. `message` is stable and safe to show to clients.
    #[error("{message}")]
    Backend {
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn backend(message: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            message,
            source: source.into(),
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserts the image record. Re-inserting an existing identifier replaces
    /// the image fields, keeps `added` and the user metadata.
    async fn insert_image(&self, image: &Image) -> Result<(), Error>;

    async fn delete_image(&self, owner: &str, identifier: &str) -> Result<(), Error>;

    /// Returns the stored image fields. The blob is never populated.
    async fn load(&self, owner: &str, identifier: &str) -> Result<Image, Error>;

    /// Replaces the whole metadata record.
    async fn update_metadata(
        &self,
        owner: &str,
        identifier: &str,
        metadata: MetadataRecord,
    ) -> Result<(), Error>;

    async fn get_metadata(&self, owner: &str, identifier: &str) -> Result<MetadataRecord, Error>;

    async fn delete_metadata(&self, owner: &str, identifier: &str) -> Result<(), Error>;

    async fn get_images(&self, owner: &str, query: &ImageQuery) -> Result<Vec<Image>, Error>;

    /// Last update of one image, or of the newest image of the owner when no
    /// identifier is given. An owner without images reports the current time.
    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: Option<&str>,
    ) -> Result<DateTime<Utc>, Error>;

    async fn get_num_images(&self, owner: &str) -> Result<usize, Error>;

    async fn get_image_mime_type(&self, owner: &str, identifier: &str) -> Result<MimeType, Error>;

    async fn status(&self) -> bool;
}

/// Builds the document written by `insert_image`, carrying over what an
/// existing document for the same identifier already holds.
pub(crate) fn upsert_document(existing: Option<ImageDocument>, image: &Image) -> ImageDocument {
    match existing {
        Some(mut document) => {
            let added = document.image.added;
            document.image = image.without_blob();
            document.image.added = added;
            document
        }
        None => ImageDocument::new(image.without_blob()),
    }
}

pub(crate) fn last_modified_of<'a>(
    documents: impl IntoIterator<Item = &'a ImageDocument>,
) -> DateTime<Utc> {
    documents
        .into_iter()
        .map(|doc| doc.image.updated)
        .max()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn query_images(
    documents: impl IntoIterator<Item = ImageDocument>,
    query: &ImageQuery,
) -> Vec<Image> {
    query
        .select(documents)
        .into_iter()
        .map(|doc| doc.image)
        .collect()
}
