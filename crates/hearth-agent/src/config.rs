use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::console::DEFAULT_CONSOLE_LINES;

pub const DEFAULT_MANIFEST_URL: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";
const DEFAULT_CONTAINER_IMAGE: &str = "eclipse-temurin:21-jre";
const DEFAULT_CONSOLE_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_CONSOLE_LOG_MAX_FILES: usize = 3;

/// Agent settings. Keys follow the agent's on-disk `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(rename = "authServer")]
    pub auth_server: String,
    #[serde(rename = "infoServer")]
    pub info_server: String,
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(deserialize_with = "bool_or_string")]
    pub forward: bool,
    #[serde(rename = "console-buffer", deserialize_with = "usize_or_string")]
    pub console_buffer: usize,
    pub web: String,
    pub sftp: String,
    #[serde(rename = "update-check", deserialize_with = "bool_or_string")]
    pub update_check: bool,
    #[serde(rename = "serverFolder")]
    pub server_folder: PathBuf,
    #[serde(rename = "templateFolder")]
    pub template_folder: PathBuf,
    #[serde(rename = "dataFolder")]
    pub data_folder: PathBuf,
    #[serde(rename = "minecraft-manifest-url")]
    pub minecraft_manifest_url: String,
    #[serde(rename = "container-image")]
    pub container_image: String,
    #[serde(rename = "console-log-max-bytes", deserialize_with = "u64_or_string")]
    pub console_log_max_bytes: u64,
    #[serde(rename = "console-log-max-files", deserialize_with = "usize_or_string")]
    pub console_log_max_files: usize,
    #[serde(rename = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auth_server: String::new(),
            info_server: String::new(),
            auth_token: String::new(),
            forward: false,
            console_buffer: DEFAULT_CONSOLE_LINES,
            web: "0.0.0.0:5656".to_string(),
            sftp: "0.0.0.0:5657".to_string(),
            update_check: true,
            server_folder: PathBuf::from("/var/lib/hearth/servers"),
            template_folder: PathBuf::from("/var/lib/hearth/templates"),
            data_folder: PathBuf::from("/etc/hearth"),
            minecraft_manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            console_log_max_bytes: DEFAULT_CONSOLE_LOG_MAX_BYTES,
            console_log_max_files: DEFAULT_CONSOLE_LOG_MAX_FILES,
            log_dir: None,
        }
    }
}

fn usize_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    u64_or_string(d).map(|v| v as usize)
}

fn u64_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(v) => Ok(v),
        Raw::Str(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got {s:?}"))),
    }
}

fn bool_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Bool(v) => Ok(v),
        Raw::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(serde::de::Error::custom(format!(
                "expected a boolean, got {s:?}"
            ))),
        },
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

impl AgentConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: AgentConfig = serde_json::from_str(raw).context("parse agent config")?;
        Ok(cfg.normalized())
    }

    /// Loads `path` if it exists, otherwise starts from defaults; then applies
    /// `HEARTH_*` overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let cfg = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_json(&raw)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        Ok(cfg.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize("HEARTH_CONSOLE_BUFFER") {
            self.console_buffer = v;
        }
        if let Some(v) = env_string("HEARTH_SERVER_FOLDER") {
            self.server_folder = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_TEMPLATE_FOLDER") {
            self.template_folder = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_DATA_FOLDER") {
            self.data_folder = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_MINECRAFT_MANIFEST_URL") {
            self.minecraft_manifest_url = v;
        }
        if let Some(v) = env_string("HEARTH_CONTAINER_IMAGE") {
            self.container_image = v;
        }
        if let Some(v) = env_u64("HEARTH_CONSOLE_LOG_MAX_BYTES") {
            self.console_log_max_bytes = v;
        }
        if let Some(v) = env_usize("HEARTH_CONSOLE_LOG_MAX_FILES") {
            self.console_log_max_files = v;
        }
        if let Some(v) = env_string("HEARTH_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.console_buffer = self.console_buffer.clamp(1, 50_000);
        self.console_log_max_bytes = self
            .console_log_max_bytes
            .clamp(64 * 1024, 1024 * 1024 * 1024);
        self.console_log_max_files = self.console_log_max_files.clamp(1, 20);
        self
    }

    pub fn server_dir(&self, server_id: &str) -> PathBuf {
        self.server_folder.join(server_id)
    }
}
