use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::Handle;
use blob_store::{BlobStorage, BlobStore};
use metadata_store::{MemoryMetadataStore, MetadataStore, RocksDBMetadataStore};
use metrics::init_provider;
use tokio::{self, signal, sync::watch};
use tracing::info;

use crate::{
    auth::RequestAuthenticator,
    config::{MetadataStoreConfig, ServerConfig},
    events::{MetricsObserver, TracingObserver},
    middleware::InstanceRequestSpan,
    persistence::PersistenceCoordinator,
    pipeline::TransformationPipeline,
    routes::{create_routes, routes_state::RouteState},
    transformations::TransformationRegistry,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub registry: Arc<TransformationRegistry>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let metadata_store: Arc<dyn MetadataStore> = match &config.metadata_store {
            MetadataStoreConfig::Memory => Arc::new(MemoryMetadataStore::new()),
            MetadataStoreConfig::Rocksdb { path } => Arc::new(
                RocksDBMetadataStore::open(path).context("error initializing metadata store")?,
            ),
        };
        let blob_store = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );
        Ok(Self::with_stores(
            config,
            metadata_store,
            blob_store,
            TransformationRegistry::with_builtins(),
        ))
    }

    /// Builds the service around already constructed backends.
    pub fn with_stores(
        config: ServerConfig,
        metadata_store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        registry: TransformationRegistry,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(());
        Self {
            config,
            shutdown_tx,
            metadata_store,
            blob_store,
            registry: Arc::new(registry),
        }
    }

    pub fn route_state(&self) -> RouteState {
        let pipeline_metrics = Arc::new(metrics::pipeline::Metrics::new());
        let pipeline = TransformationPipeline::new(self.registry.clone(), pipeline_metrics.clone())
            .with_max_dimension(self.config.transformations.max_dimension)
            .with_observer(Arc::new(TracingObserver))
            .with_observer(Arc::new(MetricsObserver::new(pipeline_metrics)));

        RouteState {
            auth: Arc::new(self.config.auth.clone()),
            authenticator: Arc::new(RequestAuthenticator::new(
                self.config.auth.freshness_window(),
            )),
            persistence: Arc::new(PersistenceCoordinator::new(
                self.metadata_store.clone(),
                self.blob_store.clone(),
                Arc::new(metrics::metadata_storage::Metrics::new()),
            )),
            metadata_store: self.metadata_store.clone(),
            blob_store: self.blob_store.clone(),
            pipeline: Arc::new(pipeline),
            metrics: Arc::new(metrics::api_io_stats::Metrics::new()),
        }
    }

    pub fn router(&self) -> Router {
        let request_span = InstanceRequestSpan::new(&self.config.env, &self.config.instance_id());
        create_routes(self.route_state(), request_span)
    }

    pub async fn start(&self) -> Result<()> {
        init_provider(
            self.config.telemetry.enable_metrics,
            self.config.telemetry.endpoint.as_ref(),
            self.config.telemetry.metrics_interval,
            self.config.telemetry.instance_id.as_ref(),
            env!("CARGO_PKG_VERSION"),
        )?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(self.router().into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
