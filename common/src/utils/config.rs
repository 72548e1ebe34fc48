use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Base URL of the external document-conversion service.
    pub conversion_api_url: String,
    /// Base URL and key of the knowledge-base (RAG) API.
    pub rag_api_base_url: String,
    pub rag_api_key: String,
    /// Chat-completions endpoint used for scanned-PDF OCR.
    #[serde(default = "default_vision_base_url")]
    pub vision_api_base_url: String,
    pub vision_api_key: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Report-generation workflow endpoint.
    pub report_api_url: String,
    pub report_api_key: String,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_vision_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_worker_pool_size() -> usize {
    4
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "app".into(),
            surrealdb_database: "app".into(),
            data_dir: default_data_dir(),
            conversion_api_url: "http://127.0.0.1:8010".into(),
            rag_api_base_url: "http://127.0.0.1:8020".into(),
            rag_api_key: String::new(),
            vision_api_base_url: default_vision_base_url(),
            vision_api_key: String::new(),
            vision_model: default_vision_model(),
            report_api_url: "http://127.0.0.1:8030/v1/workflows/run".into(),
            report_api_key: String::new(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}
