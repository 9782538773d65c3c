use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the prediction storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Local image directories
    #[serde(default)]
    pub images: ImageConfig,
    /// Detector vocabulary
    #[serde(default)]
    pub detector: DetectorConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Storage backend selection and per-backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend kind: `sqlite` or `dynamodb`
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub dynamodb: DynamoDbConfig,
}

/// Relational backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Database file path
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    /// How long a call waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

/// Partitioned backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for DynamoDB Local, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Sessions table, partition key `uid`
    #[serde(default = "default_sessions_table")]
    pub sessions_table: String,
    /// Detections table, partition key `prediction_uid`, sort key `label_score`
    #[serde(default = "default_detections_table")]
    pub detections_table: String,
    /// Secondary index keyed by `label`
    #[serde(default = "default_label_index")]
    pub label_index: String,
    /// Secondary index keyed by `score_partition` + `score`
    #[serde(default = "default_score_index")]
    pub score_index: String,
    /// Concurrent session point reads during fan-in
    #[serde(default = "default_fan_in_concurrency")]
    pub fan_in_concurrency: usize,
    /// Create missing tables and indexes at startup
    #[serde(default)]
    pub create_tables: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Where original and annotated images live on local disk
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Root holding `original/` and `predicted/`
    #[serde(default = "default_image_root")]
    pub root: PathBuf,
}

/// Detector vocabulary configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorConfig {
    /// Accepted labels; absent means the COCO set, empty means any label
    pub labels: Option<Vec<String>>,
}

// Default value functions
fn default_service_name() -> String {
    "prediction-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("predictions.db")
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_region() -> String {
    "us-west-1".to_string()
}

fn default_sessions_table() -> String {
    "prediction_sessions".to_string()
}

fn default_detections_table() -> String {
    "detection_objects".to_string()
}

fn default_label_index() -> String {
    "LabelScoreIndex".to_string()
}

fn default_score_index() -> String {
    "ScoreIndex".to_string()
}

fn default_fan_in_concurrency() -> usize {
    8
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_image_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            // Add config file if present
            .add_source(config::File::with_name("config/predictions").required(false))
            .add_source(config::File::with_name("/etc/predictions/predictions").required(false))
            // Override with environment variables
            // PREDICTIONS__STORAGE__BACKEND -> storage.backend
            .add_source(
                config::Environment::with_prefix("PREDICTIONS")
                    .separator("__")
                    .try_parsing(true),
            )
            // Deployment-level variables shared with the rest of the stack
            .set_override_option("storage.backend", std::env::var("STORAGE_TYPE").ok())?
            .set_override_option("storage.dynamodb.region", std::env::var("AWS_REGION").ok())?
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl SqliteConfig {
    /// Get the busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl ImageConfig {
    pub fn original_dir(&self) -> PathBuf {
        self.root.join("original")
    }

    pub fn predicted_dir(&self) -> PathBuf {
        self.root.join("predicted")
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite: SqliteConfig::default(),
            dynamodb: DynamoDbConfig::default(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            sessions_table: default_sessions_table(),
            detections_table: default_detections_table(),
            label_index: default_label_index(),
            score_index: default_score_index(),
            fan_in_concurrency: default_fan_in_concurrency(),
            create_tables: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            root: default_image_root(),
        }
    }
}
