mod app_config;

pub use app_config::{
    AppConfig, DatabaseConfig, EnrichmentConfig, FfmpegConfig, ServerConfig, StorageConfig,
};
