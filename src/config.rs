use std::{collections::HashMap, env, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{auth::SecretLookup, transformations::DEFAULT_MAX_DIMENSION};

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "IMAGEHOST_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub listen_addr: String,
    pub metadata_store: MetadataStoreConfig,
    pub blob_storage: BlobStorageConfig,
    pub auth: AuthConfig,
    pub transformations: TransformationsConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:9010".to_string(),
            metadata_store: Default::default(),
            blob_storage: Default::default(),
            auth: Default::default(),
            transformations: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    /// Loads the defaults overlaid with `IMAGEHOST_*` variables only.
    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Figment::new())
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        Self::extract(Figment::new().merge(Yaml::string(config_str)))
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(figment::providers::Serialized::defaults(
            ServerConfig::default(),
        ))
        .merge(figment)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.auth.freshness_window_secs == 0 {
            return Err(anyhow::anyhow!(
                "auth.freshness_window_secs must be greater than zero"
            ));
        }
        if self.transformations.max_dimension == 0 {
            return Err(anyhow::anyhow!(
                "transformations.max_dimension must be greater than zero"
            ));
        }
        if let MetadataStoreConfig::Rocksdb { path } = &self.metadata_store {
            if path.as_os_str().is_empty() {
                return Err(anyhow::anyhow!("metadata_store.path must not be empty"));
            }
        }
        if self.auth.owners.is_empty() {
            warn!("no owners configured, every request will be rejected as unknown");
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum MetadataStoreConfig {
    Memory,
    Rocksdb { path: PathBuf },
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        let path = env::current_dir()
            .map(|cwd| cwd.join("imagehost_storage/metadata"))
            .unwrap_or_else(|_| env::temp_dir().join("imagehost_storage/metadata"));
        MetadataStoreConfig::Rocksdb { path }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Maximum distance, in either direction, between a signed request's
    /// timestamp and the server clock.
    pub freshness_window_secs: u64,
    /// Owner (public key) to shared secret (private key).
    pub owners: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 120,
            owners: HashMap::new(),
        }
    }
}

impl AuthConfig {
    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_secs as i64)
    }
}

impl SecretLookup for AuthConfig {
    fn secret_for(&self, owner: &str) -> Option<&str> {
        self.owners.get(owner).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationsConfig {
    /// Largest width or height a transformation may produce.
    pub max_dimension: u32,
}

impl Default for TransformationsConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Export metrics over OTLP.
    pub enable_metrics: bool,
    // Export spans over OTLP.
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    pub endpoint: Option<String>,
    // Metrics export interval.
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Used as the "imagehost.instance.id" metric attribute.
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
