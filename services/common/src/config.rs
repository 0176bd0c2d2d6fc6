//! Application configuration.
//!
//! A single structured file (`config/obsidian.{toml,yaml,json}` or an explicit
//! path) layered with `OBSIDIAN__`-prefixed environment variables. Every value
//! falls back to a stated default, so an empty file is a valid configuration.
//! All durations are in seconds.

use serde::Deserialize;

/// Top-level configuration shared by the control plane and the edge node.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Operator API server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_address")]
    pub address: String,
    #[serde(default = "default_api_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_api_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_api_address(),
            read_timeout: default_api_timeout(),
            write_timeout: default_api_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

/// Durable store connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub database: String,
    #[serde(default = "default_db_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            username: default_db_user(),
            password: String::new(),
            ssl_mode: default_ssl_mode(),
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            max_lifetime: default_max_lifetime(),
        }
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "obsidianprotection".to_string()
}

fn default_db_user() -> String {
    "obsidian".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_max_open_conns() -> u32 {
    25
}

fn default_max_idle_conns() -> u32 {
    5
}

fn default_max_lifetime() -> u64 {
    300
}

/// Fleet management.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
    #[serde(default = "default_node_timeout")]
    pub node_timeout: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Addresses the front allocator hands out to new endpoints.
    #[serde(default = "default_front_pool_ips")]
    pub front_pool_ips: Vec<String>,
    #[serde(default = "default_front_port_start")]
    pub front_port_start: u16,
    #[serde(default = "default_front_port_end")]
    pub front_port_end: u16,
    /// Address the edge node's control API binds to.
    #[serde(default = "default_control_address")]
    pub control_address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            health_check_interval: default_health_check_interval(),
            max_nodes: default_max_nodes(),
            node_timeout: default_node_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            front_pool_ips: default_front_pool_ips(),
            front_port_start: default_front_port_start(),
            front_port_end: default_front_port_end(),
            control_address: default_control_address(),
        }
    }
}

fn default_update_interval() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_max_nodes() -> u32 {
    100
}

fn default_node_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_front_pool_ips() -> Vec<String> {
    vec!["198.51.100.10".to_string()]
}

fn default_front_port_start() -> u16 {
    25565
}

fn default_front_port_end() -> u16 {
    26565
}

fn default_control_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Flow relay and XDP attachment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enable_tcp_proxy: bool,
    #[serde(default = "default_true")]
    pub enable_udp_proxy: bool,
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout: u64,
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_xdp_interface")]
    pub xdp_interface: String,
    /// Path of the compiled XDP object.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,
    /// Grace window granted to live flows on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enable_tcp_proxy: true,
            enable_udp_proxy: true,
            tcp_timeout: default_tcp_timeout(),
            udp_timeout: default_udp_timeout(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            xdp_interface: default_xdp_interface(),
            ebpf_object: default_ebpf_object(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_udp_timeout() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    10_000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_xdp_interface() -> String {
    "eth0".to_string()
}

fn default_ebpf_object() -> String {
    "/usr/lib/obsidianprotection/minecraft-filter".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

/// API security.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enable_tls: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    #[serde(default)]
    pub enable_jwt: bool,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry: u64,
    /// Static bearer token accepted when JWT validation is disabled.
    pub api_token: Option<String>,
}

fn default_jwt_expiry() -> u64 {
    86_400
}

/// Logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl AppConfig {
    /// Load configuration, layering an optional file under environment
    /// overrides (`OBSIDIAN__api__address=...`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("config/obsidian").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("OBSIDIAN")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.security.enable_tls
            && (self.security.tls_cert_file.is_none() || self.security.tls_key_file.is_none())
        {
            return Err("tls_cert_file and tls_key_file are required when enable_tls is set".into());
        }
        if self.security.enable_jwt && self.security.jwt_secret.is_empty() {
            return Err("jwt_secret is required when enable_jwt is set".into());
        }
        if self.node.front_port_start > self.node.front_port_end {
            return Err("front_port_start must not exceed front_port_end".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = AppConfig::default();
        assert_eq!(config.api.address, "0.0.0.0:8080");
        assert_eq!(config.api.read_timeout, 30);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.node.health_check_interval, 10);
        assert_eq!(config.node.update_interval, 30);
        assert_eq!(config.proxy.tcp_timeout, 30);
        assert_eq!(config.proxy.udp_timeout, 10);
        assert_eq!(config.proxy.max_connections, 10_000);
        assert_eq!(config.proxy.buffer_size, 4096);
        assert_eq!(config.proxy.xdp_interface, "eth0");
        assert_eq!(config.security.jwt_expiry, 86_400);
    }

    #[test]
    fn empty_document_deserializes_to_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.proxy.max_connections, 10_000);
        assert_eq!(config.node.front_port_start, 25565);
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let result: Result<AppConfig, _> = serde_json::from_str(r#"{"bogus": {}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn tls_validation_requires_files() {
        let mut config = AppConfig::default();
        config.security.enable_tls = true;
        assert!(config.validate().is_err());

        config.security.tls_cert_file = Some("cert.pem".into());
        config.security.tls_key_file = Some("key.pem".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn jwt_validation_requires_secret() {
        let mut config = AppConfig::default();
        config.security.enable_jwt = true;
        assert!(config.validate().is_err());
        config.security.jwt_secret = "secret".into();
        assert!(config.validate().is_ok());
    }
}
