//! Configuration types for usenet-poster (§6 external interfaces)

use crate::types::{GroupPolicy, MessageIdFormat, ObfuscationPolicy, ProviderRole};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_connection_idle_time_s() -> u64 {
    300
}

fn default_max_connection_ttl_s() -> u64 {
    3600
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_article_size() -> u64 {
    750_000
}

fn default_max_reposts() -> u32 {
    1
}

fn default_deferred_check_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_deferred_max_retries() -> u32 {
    5
}

fn default_deferred_max_backoff() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_deferred_check_interval() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_max_input_slices() -> u32 {
    16000
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_compression_level() -> i32 {
    3
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// One upstream NNTP provider (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Provider hostname
    pub host: String,
    /// Provider port
    pub port: u16,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Use TLS
    #[serde(default)]
    pub ssl: bool,
    /// Accept self-signed/invalid certificates
    #[serde(default)]
    pub insecure_ssl: bool,
    /// Connection ceiling for this provider
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Idle connection lifetime before recycling
    #[serde(default = "default_max_connection_idle_time_s")]
    pub max_connection_idle_time_s: u64,
    /// Maximum connection lifetime before recycling, regardless of activity
    #[serde(default = "default_max_connection_ttl_s")]
    pub max_connection_ttl_s: u64,
    /// Whether this provider is usable at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Which pool this provider belongs to
    pub role: ProviderRole,
    /// Optional SOCKS/HTTP proxy URL
    #[serde(default)]
    pub proxy_url: Option<String>,
}

/// Pool-wide settings shared by both the upload and verify pools (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Minimum connections to pre-establish per provider
    #[serde(default)]
    pub min_connections: u32,
    /// How often to probe idle connections for liveness
    #[serde(default = "default_health_check_interval", with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Skip provider reachability verification at pool construction time
    #[serde(default)]
    pub skip_providers_verification_on_creation: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            health_check_interval: default_health_check_interval(),
            skip_providers_verification_on_creation: false,
        }
    }
}

/// Header-related posting options (§6)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PostHeadersConfig {
    /// Whether to attach `X-Nxg` headers
    #[serde(default)]
    pub add_ngx_header: bool,
    /// Default `From` header when not obfuscating
    #[serde(default)]
    pub default_from: Option<String>,
    /// Additional headers to attach; must never shadow the five mandatory ones
    #[serde(default)]
    pub custom_headers: Vec<(String, String)>,
}

/// Posting behavior (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostingConfig {
    /// Maximum retry attempts for a transient posting failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts
    #[serde(default = "default_retry_delay", with = "duration_secs")]
    pub retry_delay: Duration,
    /// Article body size in bytes (the last part of a file may be shorter)
    #[serde(default = "default_article_size")]
    pub article_size_in_bytes: u64,
    /// Newsgroups to post to
    pub groups: Vec<String>,
    /// Bytes/sec throttle (0 or absent = unlimited)
    #[serde(default)]
    pub throttle_rate: Option<u64>,
    /// Message-id generation strategy
    #[serde(default)]
    pub message_id_format: MessageIdFormat,
    /// Obfuscation policy for data-file articles
    #[serde(default)]
    pub obfuscation_policy: ObfuscationPolicy,
    /// Obfuscation policy for PAR2-file articles
    #[serde(default)]
    pub par2_obfuscation_policy: ObfuscationPolicy,
    /// How newsgroups are assigned across a file's articles
    #[serde(default)]
    pub group_policy: GroupPolicy,
    /// Wait for PAR2 generation before posting
    #[serde(default)]
    pub wait_for_par2: bool,
    /// Header-related options
    #[serde(default)]
    pub post_headers: PostHeadersConfig,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            article_size_in_bytes: default_article_size(),
            groups: Vec::new(),
            throttle_rate: None,
            message_id_format: MessageIdFormat::default(),
            obfuscation_policy: ObfuscationPolicy::default(),
            par2_obfuscation_policy: ObfuscationPolicy::default(),
            group_policy: GroupPolicy::default(),
            wait_for_par2: false,
            post_headers: PostHeadersConfig::default(),
        }
    }
}

/// In-job verification and deferred-check policy (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostCheckConfig {
    /// Whether any verification (in-job or deferred) runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay before the first in-job STAT probe after posting completes
    #[serde(default, with = "duration_secs")]
    pub delay: Duration,
    /// Maximum partial-repost attempts per file during in-job verification
    #[serde(default = "default_max_reposts")]
    pub max_reposts: u32,
    /// Use deferred (background) verification instead of in-job verification
    #[serde(default)]
    pub deferred_check: bool,
    /// Delay before the first deferred STAT attempt
    #[serde(default = "default_deferred_check_delay", with = "duration_secs")]
    pub deferred_check_delay: Duration,
    /// Maximum deferred retry attempts before marking a check failed
    #[serde(default = "default_deferred_max_retries")]
    pub deferred_max_retries: u32,
    /// Maximum backoff between deferred retries
    #[serde(default = "default_deferred_max_backoff", with = "duration_secs")]
    pub deferred_max_backoff: Duration,
    /// How often the deferred-check worker polls for due checks
    #[serde(default = "default_deferred_check_interval", with = "duration_secs")]
    pub deferred_check_interval: Duration,
}

impl Default for PostCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::ZERO,
            max_reposts: default_max_reposts(),
            deferred_check: false,
            deferred_check_delay: default_deferred_check_delay(),
            deferred_max_retries: default_deferred_max_retries(),
            deferred_max_backoff: default_deferred_max_backoff(),
            deferred_check_interval: default_deferred_check_interval(),
        }
    }
}

/// PAR2 redundancy generation settings (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Par2Config {
    /// Whether to generate redundancy volumes before posting
    #[serde(default)]
    pub enabled: bool,
    /// Redundancy percentage (e.g. 10 = 10%)
    #[serde(default)]
    pub redundancy: u32,
    /// Target volume size in bytes (0 = let par2 decide)
    #[serde(default)]
    pub volume_size: u64,
    /// Maximum input slices passed to par2
    #[serde(default = "default_max_input_slices")]
    pub max_input_slices: u32,
    /// Additional CLI options passed through to the par2 binary
    #[serde(default)]
    pub extra_par2_options: Vec<String>,
    /// Directory for intermediate par2 output
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Keep generated par2 files around after posting completes
    #[serde(default)]
    pub maintain_par2_files: bool,
}

impl Default for Par2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            redundancy: 10,
            volume_size: 0,
            max_input_slices: default_max_input_slices(),
            extra_par2_options: Vec::new(),
            temp_dir: None,
            maintain_par2_files: false,
        }
    }
}

/// Durable queue settings (§6)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,
    /// Maximum number of jobs the processor drains concurrently
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// How often the processor checks for new capacity
    #[serde(default = "default_tick_interval", with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("usenet-poster.db"),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            tick_interval: default_tick_interval(),
        }
    }
}

/// Compression applied to the generated NZB file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NzbCompressionType {
    /// No compression
    #[default]
    None,
    /// zstd compression
    Zstd,
    /// brotli compression
    Brotli,
}

/// NZB output compression settings (§6)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NzbCompressionConfig {
    /// Whether to compress the NZB after writing
    #[serde(default)]
    pub enabled: bool,
    /// Compression algorithm
    #[serde(default)]
    pub r#type: NzbCompressionType,
    /// Compression level (algorithm-specific)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

/// Top-level configuration, deserializable from TOML/JSON/YAML via serde
/// (the format itself is an external-collaborator concern, §1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Configured NNTP providers (upload and verify roles)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Pool-wide connection settings
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    /// Posting behavior
    #[serde(default)]
    pub posting: PostingConfig,
    /// In-job and deferred verification policy
    #[serde(default)]
    pub post_check: PostCheckConfig,
    /// PAR2 redundancy generation
    #[serde(default)]
    pub par2: Par2Config,
    /// Durable queue settings
    pub queue: QueueConfig,
    /// NZB output compression
    #[serde(default)]
    pub nzb_compression: NzbCompressionConfig,
    /// Directory NZB files are written to
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connection_pool: ConnectionPoolConfig::default(),
            posting: PostingConfig::default(),
            post_check: PostCheckConfig::default(),
            par2: Par2Config::default(),
            queue: QueueConfig::default(),
            nzb_compression: NzbCompressionConfig::default(),
            output_dir: PathBuf::from("./nzb"),
        }
    }
}

impl Config {
    /// Providers assigned to the given role, excluding disabled ones
    pub fn providers_for_role(&self, role: ProviderRole) -> Vec<&ServerConfig> {
        self.servers
            .iter()
            .filter(|s| s.enabled && s.role == role)
            .collect()
    }
}

impl From<ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.ssl,
            allow_insecure_tls: config.insecure_ssl,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_servers() {
        let mut cfg = Config::default();
        cfg.queue.database_path = PathBuf::from(":memory:");
        assert!(cfg.servers.is_empty());
        assert_eq!(cfg.post_check.max_reposts, 1);
    }

    #[test]
    fn providers_for_role_excludes_disabled() {
        let mut cfg = Config::default();
        cfg.servers.push(ServerConfig {
            host: "a".into(),
            port: 119,
            username: None,
            password: None,
            ssl: false,
            insecure_ssl: false,
            max_connections: 10,
            max_connection_idle_time_s: 300,
            max_connection_ttl_s: 3600,
            enabled: false,
            role: ProviderRole::Upload,
            proxy_url: None,
        });
        cfg.servers.push(ServerConfig {
            host: "b".into(),
            port: 119,
            username: None,
            password: None,
            ssl: false,
            insecure_ssl: false,
            max_connections: 10,
            max_connection_idle_time_s: 300,
            max_connection_ttl_s: 3600,
            enabled: true,
            role: ProviderRole::Upload,
            proxy_url: None,
        });
        let providers = cfg.providers_for_role(ProviderRole::Upload);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].host, "b");
    }
}
