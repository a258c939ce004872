//! Configuration types

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub readme: ReadmeSettings,
    #[serde(default)]
    pub limits: LimitSettings,
}

/// HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            enable_logging: true,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Image build and container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_base_image")]
    pub base_image: String,
    /// Repository part of built image tags
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    /// Container names are `<container_prefix>-<sandbox id>`
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,
    /// Host address published ports are bound to
    #[serde(default = "default_publish_host")]
    pub publish_host: String,
    #[serde(default = "default_true")]
    pub reuse_images: bool,
    #[serde(default = "default_true")]
    pub sweep_orphans_on_boot: bool,
    /// Also remove built images no live sandbox uses when sweeping
    #[serde(default)]
    pub prune_images_on_sweep: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            image_prefix: default_image_prefix(),
            container_prefix: default_container_prefix(),
            build_timeout_secs: default_build_timeout(),
            start_timeout_secs: default_start_timeout(),
            stop_grace_secs: default_stop_grace(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval(),
            publish_host: default_publish_host(),
            reuse_images: true,
            sweep_orphans_on_boot: true,
            prune_images_on_sweep: false,
        }
    }
}

/// OpenAI-compatible chat completion endpoint used to generate setup scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSettings {
    #[serde(default = "default_oracle_api_base")]
    pub api_base: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            api_base: default_oracle_api_base(),
            model: default_oracle_model(),
            api_key: None,
            temperature: None,
            timeout_secs: default_oracle_timeout(),
        }
    }
}

/// GitHub REST API used to fetch READMEs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadmeSettings {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_readme_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReadmeSettings {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            token: None,
            timeout_secs: default_readme_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Admission cap on RUNNING sandboxes. Unlimited when absent.
    #[serde(default)]
    pub max_sandboxes: Option<usize>,
    /// Default per-call timeout for tool traffic
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Stopped or failed sandboxes kept for LIST and id lookups; the oldest
    /// are forgotten first.
    #[serde(default = "default_retained_stopped")]
    pub retained_stopped: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sandboxes: None,
            call_timeout_secs: default_call_timeout(),
            retained_stopped: default_retained_stopped(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_size() -> usize {
    2 * 1024 * 1024
}

fn default_base_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_image_prefix() -> String {
    "mcpbox-sandbox".to_string()
}

fn default_container_prefix() -> String {
    "mcpbox".to_string()
}

fn default_build_timeout() -> u64 {
    900
}

fn default_start_timeout() -> u64 {
    60
}

fn default_stop_grace() -> u64 {
    10
}

fn default_ready_attempts() -> u32 {
    5
}

fn default_ready_interval() -> u64 {
    1000
}

fn default_publish_host() -> String {
    "127.0.0.1".to_string()
}

fn default_oracle_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_oracle_model() -> String {
    "gpt-4o".to_string()
}

fn default_oracle_timeout() -> u64 {
    120
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_readme_timeout() -> u64 {
    20
}

fn default_call_timeout() -> u64 {
    30
}

fn default_retained_stopped() -> usize {
    256
}
