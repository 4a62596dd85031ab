use std::collections::HashMap;

use serde::Deserialize;

fn default_sync_interval() -> u64 {
    30
}

fn default_notification_timeout() -> u64 {
    2 * 3600
}

fn default_rate_limit_messages() -> u32 {
    5
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_rate_limit_cooldown() -> u64 {
    300
}

fn default_blocking_threads() -> usize {
    12
}

/// Top-level validated configuration. Constructed by [`crate::loader::load_from_path`]
/// and [`crate::validation::validate`]; never built directly in production code.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub destination: DatabaseEndpoint,
    pub server: ServerConfig,
    pub chat: ChatConfig,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_secs: u64,
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,

    #[serde(default)]
    pub table_names: HashMap<String, String>,

    #[serde(default)]
    pub db_to_db_jobs: Vec<DbToDbJobConfig>,
    #[serde(default)]
    pub foreign_jobs: Vec<ForeignJobConfig>,
    #[serde(default)]
    pub file_ingest: Option<FileIngestConfig>,
}

/// A reachable relational endpoint: host, port, database, credentials, and
/// (for source endpoints) the table being read.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEndpoint {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub table: Option<String>,
}

fn default_db_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_rate_limit_messages")]
    pub rate_limit_messages: u32,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbToDbJobConfig {
    pub name: String,
    pub source: DatabaseEndpoint,
    pub destination_table: String,
    pub sync_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForeignJobConfig {
    pub name: String,
    pub foreign: DatabaseEndpoint,
    pub destination_table: String,
    pub object_filter_id: String,
    pub sync_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileIngestConfig {
    #[serde(default)]
    pub enabled: bool,
    pub files_directory: String,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_days_to_search")]
    pub days_to_search: u32,
    #[serde(default = "default_skip_footer_rows")]
    pub skip_footer_rows: usize,
    pub target_table: String,
    #[serde(default = "default_network_check_interval")]
    pub network_check_interval_secs: u64,
    #[serde(default = "default_file_check_interval")]
    pub file_check_interval_secs: u64,
    pub object_id: String,
    pub id_value: String,
    pub objid_value: String,
    pub service: NetworkServiceConfig,
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_days_to_search() -> u32 {
    7
}

fn default_skip_footer_rows() -> usize {
    1
}

fn default_network_check_interval() -> u64 {
    300
}

fn default_file_check_interval() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkServiceConfig {
    pub run_as_user: String,
    pub run_as_password: String,
}
