use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_model::{Image, ImageDocument, ImageQuery, MetadataRecord, MimeType};
use tokio::sync::RwLock;

use crate::{last_modified_of, query_images, upsert_document, Error, MetadataStore};

type DocumentKey = (String, String);

fn key(owner: &str, identifier: &str) -> DocumentKey {
    (owner.to_string(), identifier.to_string())
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    documents: RwLock<HashMap<DocumentKey, ImageDocument>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn owner_documents(&self, owner: &str) -> Vec<ImageDocument> {
        self.documents
            .read()
            .await
            .iter()
            .filter(|((doc_owner, _), _)| doc_owner == owner)
            .map(|(_, doc)| doc.clone())
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_image(&self, image: &Image) -> Result<(), Error> {
        let mut documents = self.documents.write().await;
        let key = key(&image.owner, &image.identifier);
        let document = upsert_document(documents.remove(&key), image);
        documents.insert(key, document);
        Ok(())
    }

    async fn delete_image(&self, owner: &str, identifier: &str) -> Result<(), Error> {
        self.documents
            .write()
            .await
            .remove(&key(owner, identifier))
            .map(|_| ())
            .ok_or(Error::ImageNotFound)
    }

    async fn load(&self, owner: &str, identifier: &str) -> Result<Image, Error> {
        self.documents
            .read()
            .await
            .get(&key(owner, identifier))
            .map(|doc| doc.image.clone())
            .ok_or(Error::ImageNotFound)
    }

    async fn update_metadata(
        &self,
        owner: &str,
        identifier: &str,
        metadata: MetadataRecord,
    ) -> Result<(), Error> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&key(owner, identifier))
            .ok_or(Error::ImageNotFound)?;
        document.metadata = metadata;
        document.image.updated = Utc::now();
        Ok(())
    }

    async fn get_metadata(&self, owner: &str, identifier: &str) -> Result<MetadataRecord, Error> {
        self.documents
            .read()
            .await
            .get(&key(owner, identifier))
            .map(|doc| doc.metadata.clone())
            .ok_or(Error::ImageNotFound)
    }

    async fn delete_metadata(&self, owner: &str, identifier: &str) -> Result<(), Error> {
        self.update_metadata(owner, identifier, MetadataRecord::default())
            .await
    }

    async fn get_images(&self, owner: &str, query: &ImageQuery) -> Result<Vec<Image>, Error> {
        Ok(query_images(self.owner_documents(owner).await, query))
    }

    async fn get_last_modified(
        &self,
        owner: &str,
        identifier: Option<&str>,
    ) -> Result<DateTime<Utc>, Error> {
        match identifier {
            Some(identifier) => self
                .load(owner, identifier)
                .await
                .map(|image| image.updated),
            None => Ok(last_modified_of(&self.owner_documents(owner).await)),
        }
    }

    async fn get_num_images(&self, owner: &str) -> Result<usize, Error> {
        Ok(self
            .documents
            .read()
            .await
            .keys()
            .filter(|(doc_owner, _)| doc_owner == owner)
            .count())
    }

    async fn get_image_mime_type(&self, owner: &str, identifier: &str) -> Result<MimeType, Error> {
        self.load(owner, identifier)
            .await
            .map(|image| image.mime_type)
    }

    async fn status(&self) -> bool {
        true
    }
}
