use std::sync::Arc;

use blob_store::BlobStore;
use metadata_store::MetadataStore;
use metrics::api_io_stats;

use crate::{
    auth::RequestAuthenticator,
    config::AuthConfig,
    persistence::PersistenceCoordinator,
    pipeline::TransformationPipeline,
};

#[derive(Clone)]
pub struct RouteState {
    pub auth: Arc<AuthConfig>,
    pub authenticator: Arc<RequestAuthenticator>,
    pub persistence: Arc<PersistenceCoordinator>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub pipeline: Arc<TransformationPipeline>,
    pub metrics: Arc<api_io_stats::Metrics>,
}
