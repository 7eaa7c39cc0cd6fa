use std::time::Duration;

use seenmark_domain::seen_batch::SeenBatchConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub seen_tenant_id: String,
    pub seen_flush_interval_ms: u64,
    pub seen_flush_threshold: usize,
    pub seen_flush_concurrency: usize,
    pub seen_intake_capacity: usize,
    pub metrics_enabled: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_builder(
            config::Config::builder().add_source(config::Environment::default().separator("__")),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, config::ConfigError> {
        let cfg = builder
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "seenmark")?
            .set_default("surreal_db", "comments")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("seen_tenant_id", "default")?
            .set_default("seen_flush_interval_ms", 1000)?
            .set_default("seen_flush_threshold", 1000)?
            .set_default("seen_flush_concurrency", 8)?
            .set_default("seen_intake_capacity", 1024)?
            .set_default("metrics_enabled", true)?
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.seen_flush_interval_ms.max(1))
    }

    pub fn seen_batch_config(&self) -> SeenBatchConfig {
        SeenBatchConfig {
            flush_threshold: self.seen_flush_threshold,
            flush_concurrency: self.seen_flush_concurrency.max(1),
        }
    }

    pub fn intake_capacity(&self) -> usize {
        self.seen_intake_capacity.max(1)
    }
}
