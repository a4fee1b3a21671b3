use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "magnet.json";
pub const TOKEN_VAR: &str = "BOT_TOKEN";
pub const APK_URL_VAR: &str = "APK_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set!")]
    Missing(&'static str),
    #[error("Failed to read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: json5::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BotConfig {
    /// Bot credential. Usually supplied through `BOT_TOKEN`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Remote link of the base package. Usually supplied through `APK_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apk_url: Option<String>,
    pub base_package: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_root: Option<PathBuf>,
    pub artifact_prefix: String,
    pub artifact_extension: String,
    pub min_base_size: u64,
    pub id_asset: String,
    pub url_asset: String,
    pub tools: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolConfig {
    pub apktool: String,
    pub signer: String,
    pub signed_suffix: String,
    pub unpack_timeout_secs: u64,
    pub repack_timeout_secs: u64,
    pub sign_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: None,
            apk_url: None,
            base_package: PathBuf::from("magnet.apk"),
            work_root: None,
            artifact_prefix: "magnet_".to_string(),
            artifact_extension: "apk".to_string(),
            min_base_size: 10 * 1024,
            id_asset: "id.txt".to_string(),
            url_asset: "url.txt".to_string(),
            tools: ToolConfig::default(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            apktool: "apktool".to_string(),
            signer: "uber-apk-signer".to_string(),
            signed_suffix: "-aligned-debugSigned.apk".to_string(),
            unpack_timeout_secs: 120,
            repack_timeout_secs: 180,
            sign_timeout_secs: 120,
        }
    }
}

impl ToolConfig {
    pub fn unpack_timeout(&self) -> Duration {
        Duration::from_secs(self.unpack_timeout_secs)
    }

    pub fn repack_timeout(&self) -> Duration {
        Duration::from_secs(self.repack_timeout_secs)
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_secs(self.sign_timeout_secs)
    }
}

impl BotConfig {
    /// Template written by `init`. Secrets are left out on purpose.
    pub fn template() -> Self {
        Self::default()
    }

    /// Loads the optional file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        json5::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_VAR) {
            self.token = Some(token);
        }
        if let Some(url) = lookup(APK_URL_VAR) {
            self.apk_url = Some(url);
        }
        self.token = self.token.take().filter(|v| !v.trim().is_empty());
        self.apk_url = self.apk_url.take().filter(|v| !v.trim().is_empty());
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::Missing(TOKEN_VAR))
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn artifact_file_name(&self, user_id: u64) -> String {
        format!(
            "{}{user_id}.{}",
            self.artifact_prefix, self.artifact_extension
        )
    }
}

/// Walks up from `start_dir` looking for `magnet.json`.
pub fn find_config_file(start_dir: PathBuf) -> Option<PathBuf> {
    let mut current_dir = start_dir;

    loop {
        let candidate = current_dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }

        match current_dir.parent() {
            Some(parent) => current_dir = parent.to_path_buf(),
            None => return None,
        }
    }
}
