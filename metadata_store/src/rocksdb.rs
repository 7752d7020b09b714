use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_model::{Image, ImageDocument, ImageQuery, MetadataRecord, MimeType};
use metrics::{metadata_storage::Metrics, Timer};
use opentelemetry::KeyValue;
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    IteratorMode,
    Options,
    TransactionDB,
    TransactionDBOptions,
};
use tracing::info;

use crate::{
    last_modified_of,
    query_images,
    upsert_document,
    Error,
    MetadataStore,
    DELETE_IMAGE_FAILED,
    DELETE_METADATA_FAILED,
    FETCH_IMAGE_FAILED,
    FETCH_INFO_FAILED,
    FETCH_METADATA_FAILED,
    FETCH_MIME_TYPE_FAILED,
    SAVE_IMAGE_FAILED,
    SEARCH_FAILED,
    UPDATE_METADATA_FAILED,
};

const IMAGES_CF: &str = "images";

/// Documents are JSON encoded under `owner/identifier`. Owners and
/// identifiers never contain `/`, so an owner's images form one key prefix.
fn document_key(owner: &str, identifier: &str) -> String {
    format!("{owner}/{identifier}")
}

fn owner_prefix(owner: &str) -> String {
    format!("{owner}/")
}

pub struct RocksDBMetadataStore {
    db: TransactionDB,
    metrics: Metrics,
}

impl RocksDBMetadataStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path,
            vec![ColumnFamilyDescriptor::new(IMAGES_CF, Options::default())],
        )?;
        info!(path = %path.display(), "opened rocksdb metadata store");

        Ok(Self {
            db,
            metrics: Metrics::new(),
        })
    }

    fn images_cf(&self, message: &'static str) -> Result<&ColumnFamily, Error> {
        self.db
            .cf_handle(IMAGES_CF)
            .ok_or_else(|| Error::backend(message, anyhow::anyhow!("missing column family")))
    }

    fn read_document(
        &self,
        owner: &str,
        identifier: &str,
        message: &'static str,
    ) -> Result<ImageDocument, Error> {
        let labels = [KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.reads, &labels);

        let cf = self.images_cf(message)?;
        let raw = self
            .db
            .get_cf(cf, document_key(owner, identifier))
            .map_err(|e| Error::backend(message, e))?
            .ok_or(Error::ImageNotFound)?;
        serde_json::from_slice(&raw).map_err(|e| Error::backend(message, e))
    }

    fn owner_documents(&self, owner: &str, message: &'static str) -> Result<Vec<ImageDocument>, Error> {
        let labels = [KeyValue::new("op", "scan")];
        let _timer = Timer::start_with_labels(&self.metrics.reads, &labels);

        let cf = self.images_cf(message)?;
        let prefix = owner_prefix(owner);
        let mut documents = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| Error::backend(message, e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            documents.push(serde_json::from_slice(&value).map_err(|e| Error::backend(message, e))?);
        }
        Ok(documents)
    }

    /// Read-modify-write of one document inside a transaction.
    fn modify_document<F>(
        &self,
        owner: &str,
        identifier: &str,
        message: &'static str,
        modify: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Option<ImageDocument>) -> Result<ImageDocument, Error>,
    {
        let labels = [KeyValue::new("op", "modify")];
        let _timer = Timer::start_with_labels(&self.metrics.writes, &labels);

        let cf = self.images_cf(message)?;
        let key = document_key(owner, identifier);
        let tx = self.db.transaction();
        let existing = tx
            .get_for_update_cf(cf, &key, true)
            .map_err(|e| Error::backend(message, e))?
            .map(|raw| serde_json::from_slice::<ImageDocument>(&raw))
            .transpose()
            .map_err(|e| Error::backend(message, e))?;
        let document = modify(existing)?;
        let encoded = serde_json::to_vec(&document).map_err(|e| Error::backend(message, e))?;
        tx.put_cf(cf, &key, encoded)
            .map_err(|e| Error::backend(message, e))?;
        tx.commit().map_err(|e| Error::backend(message, e))
    }
}

#[async_trait]
impl MetadataStore for RocksDBMetadataStore {
    async fn insert_image(&self, image: &Image) -> Result<(), Error> {
        self.modify_document(
            &image.owner,
            &image.identifier,
            SAVE_IMAGE_FAILED,
            |existing| Ok(upsert_document(existing, image)),
        )
    }

    async fn delete_image(&self, owner: &str, identifier: &str) -> Result<(), Error> {
        let labels = [KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.writes, &labels);

        let cf = self.images_cf(DELETE_IMAGE_FAILED)?;
        let key = document_key(owner, identifier);
        let tx = self.db.transaction();
        let existing = tx
            .get_for_update_cf(cf, &key, true)
            .map_err(|e| Error::backend(DELETE_IMAGE_FAILED, e))?;
        if existing.is_none() {
            return Err(Error::ImageNotFound);
        }
        tx.delete_cf(cf, &key)
            .map_err(|e| Error::backend(DELETE_IMAGE_FAILED, e))?;
        tx.commit()
            .map_err(|e| Error::backend(DELETE_IMAGE_FAILED, e))
    }

    async fn load(&self, owner: &str, identifier: &str) -> Result<Image, Error> {
        self.read_document(owner, identifier, FETCH_IMAGE_FAILED)
            .map(|doc| doc.image)
    }

    async fn update_metadata(
        &self,
        owner: &str,
        identifier: &str,
        metadata: MetadataRecord,
    ) -> Result<(), Error> {
        self.modify_document(owner, identifier, UPDATE_METADATA_FAILED, |existing| {
            let mut document = existing.ok_or(Error::ImageNotFound)?;
            document.metadata = metadata;
            document.image.updated = Utc::now();
            Ok(document)
        })
    }

    async fn get_metadata(&self, owner: &str, identifier: &str) -> Result<MetadataRecord, Error> {
        self.read_document(owner, identifier, FETCH_METADATA_FAILED)
            .map(|doc| doc.metadata)
    }

    async fn delete_metadata(&self, owner: &str, identifier: &str) -> Result<(), Error> {
        self.modify_document(owner, identifier, DELETE_METADATA_FAILED, |existing| {
            let mut document = existing.ok_or(Error::ImageNotFound)?;
            document.metadata = MetadataRecord::default();
            document.image.updated = Utc::now();
            Ok(document)
        })
    }

    async fn get_images(&self, owner: &str, query: &ImageQuery) -> Result<Vec<Image>, Error> {
        let documents = self.owner_documents(owner, SEARCH_FAILED)?;
        Ok(query_images(documents, query))
    }

    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: Option<&str>,
    ) -> Result<DateTime<Utc>, Error> {
        match identifier {
            Some(identifier) => self
                .read_document(owner, identifier, FETCH_IMAGE_FAILED)
                .map(|doc| doc.image.updated),
            None => {
                let documents = self.owner_documents(owner, FETCH_IMAGE_FAILED)?;
                Ok(last_modified_of(&documents))
            }
        }
    }

    async fn get_num_images(&self, owner: &str) -> Result<usize, Error> {
        Ok(self.owner_documents(owner, FETCH_INFO_FAILED)?.len())
    }

    async fn get_image_mime_type(&self, owner: &str, identifier: &str) -> Result<MimeType, Error> {
        self.read_document(owner, identifier, FETCH_MIME_TYPE_FAILED)
            .map(|doc| doc.image.mime_type)
    }

    async fn status(&self) -> bool {
        self.images_cf(FETCH_INFO_FAILED).is_ok()
    }
}
