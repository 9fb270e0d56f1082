use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "mediatool.toml";
pub const DEFAULT_USER_AGENT: &str = "mediatool/0.1";
pub const DEFAULT_ACCEPT_VERSION: &str = "v5.0";
pub const DEFAULT_TOKEN_TTL_MINUTES: u64 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WEBP_QUALITY: u8 = 80;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 250;
pub const DEFAULT_DUMP_COMMAND: &str = "mysqldump";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MediaToolConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub conversion: ConversionSection,
    #[serde(default)]
    pub executor: ExecutorSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub admin_api_key: Option<String>,
    pub token_ttl_minutes: Option<u64>,
    pub accept_version: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PathsSection {
    pub ghost_root: Option<PathBuf>,
    pub images: Option<PathBuf>,
    pub media: Option<PathBuf>,
    pub files: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub dump_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConversionSection {
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExecutorSection {
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub page_size: Option<u32>,
    pub rate_limit_ms: Option<u64>,
}

impl MediaToolConfig {
    /// Site URL: env GHOST_API_URL > config.
    pub fn site_url(&self) -> Option<String> {
        env_value("GHOST_API_URL").or_else(|| non_empty(self.site.url.as_deref()))
    }

    /// Admin API key in `id:secret` form: env GHOST_ADMIN_API_KEY > config.
    pub fn admin_api_key(&self) -> Option<String> {
        env_value("GHOST_ADMIN_API_KEY").or_else(|| non_empty(self.site.admin_api_key.as_deref()))
    }

    pub fn token_ttl(&self) -> Duration {
        let minutes = self
            .site
            .token_ttl_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    pub fn accept_version(&self) -> String {
        non_empty(self.site.accept_version.as_deref())
            .unwrap_or_else(|| DEFAULT_ACCEPT_VERSION.to_string())
    }

    pub fn user_agent(&self) -> String {
        non_empty(self.site.user_agent.as_deref()).unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        self.site.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn images_dir(&self) -> Option<PathBuf> {
        self.content_dir(self.paths.images.as_ref(), "images")
    }

    pub fn media_dir(&self) -> Option<PathBuf> {
        self.content_dir(self.paths.media.as_ref(), "media")
    }

    pub fn files_dir(&self) -> Option<PathBuf> {
        self.content_dir(self.paths.files.as_ref(), "files")
    }

    fn content_dir(&self, explicit: Option<&PathBuf>, name: &str) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.clone());
        }
        self.paths
            .ghost_root
            .as_ref()
            .map(|root| root.join("content").join(name))
    }

    /// Directory archived by the content backup step: `ghost_root`, else the
    /// parent of the images directory.
    pub fn archive_source(&self) -> Option<PathBuf> {
        if let Some(root) = &self.paths.ghost_root {
            return Some(root.clone());
        }
        self.images_dir()
            .and_then(|images| images.parent().map(Path::to_path_buf))
    }

    pub fn database_configured(&self) -> bool {
        non_empty(self.database.name.as_deref()).is_some()
    }

    /// Database password: env GHOST_DB_PASSWORD > config.
    pub fn database_password(&self) -> Option<String> {
        env_value("GHOST_DB_PASSWORD").or_else(|| self.database.password.clone())
    }

    pub fn dump_command(&self) -> String {
        non_empty(self.database.dump_command.as_deref())
            .unwrap_or_else(|| DEFAULT_DUMP_COMMAND.to_string())
    }

    pub fn webp_quality(&self) -> u8 {
        self.conversion
            .quality
            .unwrap_or(DEFAULT_WEBP_QUALITY)
            .min(100)
    }

    pub fn max_retries(&self) -> usize {
        self.executor.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.executor.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }

    pub fn page_size(&self) -> u32 {
        self.executor
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn rate_limit_ms(&self) -> u64 {
        self.executor.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS)
    }

    /// Checks the settings every remote command needs before any request is issued.
    pub fn require_remote(&self) -> Result<(String, String)> {
        let Some(url) = self.site_url() else {
            bail!("site URL is not configured (set [site].url or GHOST_API_URL)");
        };
        let Some(key) = self.admin_api_key() else {
            bail!("admin API key is not configured (set [site].admin_api_key or GHOST_ADMIN_API_KEY)");
        };
        Ok((url, key))
    }
}

/// Load and parse a MediaToolConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MediaToolConfig> {
    if !config_path.exists() {
        return Ok(MediaToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MediaToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn starter_config() -> String {
    format!(
        r#"# mediatool configuration

[site]
# url = "https://example.com"
# admin_api_key = "<id>:<hex secret>"
token_ttl_minutes = {DEFAULT_TOKEN_TTL_MINUTES}
accept_version = "{DEFAULT_ACCEPT_VERSION}"

[paths]
# ghost_root = "/var/www/ghost"
# backup_dir = "/var/backups/ghost"

[database]
# host = "localhost"
# port = 3306
# user = "ghost"
# name = "ghost_production"
# password is read from GHOST_DB_PASSWORD when set

[conversion]
quality = {DEFAULT_WEBP_QUALITY}

[executor]
max_retries = {DEFAULT_MAX_RETRIES}
retry_delay_ms = {DEFAULT_RETRY_DELAY_MS}
page_size = {DEFAULT_PAGE_SIZE}
rate_limit_ms = {DEFAULT_RATE_LIMIT_MS}
"#
    )
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_empty(Some(&value)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
