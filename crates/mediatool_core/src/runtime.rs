use std::env;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::debug;

use crate::config::{DEFAULT_CONFIG_FILENAME, MediaToolConfig, starter_config};

pub const DEFAULT_STATE_DIRNAME: &str = ".mediatool";
pub const JOURNALS_DIRNAME: &str = "journals";
pub const LOCK_FILENAME: &str = "run.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub config_source: ValueSource,
    pub state_dir: PathBuf,
    pub state_source: ValueSource,
    pub journal_dir: PathBuf,
    pub lock_path: PathBuf,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "config_path={} ({})\nstate_dir={} ({})\njournal_dir={}\nlock_path={}",
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.state_dir),
            self.state_source.as_str(),
            normalize_for_display(&self.journal_dir),
            normalize_for_display(&self.lock_path),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub config_exists: bool,
    pub state_dir_exists: bool,
    pub journal_count: usize,
    pub lock_held: bool,
    pub warnings: Vec<String>,
}

pub fn locate_config(context: &ResolutionContext, overrides: &PathOverrides) -> ConfigLocation {
    locate_config_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn locate_config_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> ConfigLocation
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.config.as_deref() {
        return ConfigLocation {
            path: absolutize(path, &context.cwd),
            source: ValueSource::Flag,
        };
    }
    if let Some(value) = lookup_env("MEDIATOOL_CONFIG").filter(|value| !value.trim().is_empty()) {
        return ConfigLocation {
            path: absolutize(Path::new(value.trim()), &context.cwd),
            source: ValueSource::Env,
        };
    }
    ConfigLocation {
        path: context.cwd.join(DEFAULT_CONFIG_FILENAME),
        source: ValueSource::Default,
    }
}

pub fn resolve_paths(
    overrides: &PathOverrides,
    location: ConfigLocation,
    config: &MediaToolConfig,
) -> ResolvedPaths {
    resolve_paths_with_lookup(overrides, location, config, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    overrides: &PathOverrides,
    location: ConfigLocation,
    config: &MediaToolConfig,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let config_dir = location
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let (state_dir, state_source) = if let Some(path) = overrides.state_dir.as_deref() {
        (absolutize(path, &config_dir), ValueSource::Flag)
    } else if let Some(value) =
        lookup_env("MEDIATOOL_STATE_DIR").filter(|value| !value.trim().is_empty())
    {
        (
            absolutize(Path::new(value.trim()), &config_dir),
            ValueSource::Env,
        )
    } else if let Some(path) = config.paths.state_dir.as_deref() {
        (absolutize(path, &config_dir), ValueSource::Config)
    } else {
        (config_dir.join(DEFAULT_STATE_DIRNAME), ValueSource::Default)
    };

    ResolvedPaths {
        config_path: location.path,
        config_source: location.source,
        journal_dir: state_dir.join(JOURNALS_DIRNAME),
        lock_path: state_dir.join(LOCK_FILENAME),
        state_dir,
        state_source,
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths, config: &MediaToolConfig) -> Result<RuntimeStatus> {
    let journal_count = if paths.journal_dir.exists() {
        let entries = fs::read_dir(&paths.journal_dir)
            .with_context(|| format!("failed to read {}", paths.journal_dir.display()))?;
        let mut count = 0;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read {}", paths.journal_dir.display()))?;
            if entry.path().extension().and_then(|ext| ext.to_str()) == Some("db") {
                count += 1;
            }
        }
        count
    } else {
        0
    };

    let mut warnings = Vec::new();
    if config.site_url().is_none() {
        warnings.push("site URL is not configured; remote commands will fail".to_string());
    }
    for (label, dir) in [
        ("images", config.images_dir()),
        ("media", config.media_dir()),
        ("files", config.files_dir()),
    ] {
        match dir {
            Some(dir) if !dir.exists() => warnings.push(format!(
                "{label} directory {} does not exist",
                normalize_for_display(&dir)
            )),
            None => warnings.push(format!("{label} directory is not configured")),
            Some(_) => {}
        }
    }
    if paths.lock_path.exists() {
        warnings.push(format!(
            "run lock present at {}; delete it if no run is active",
            normalize_for_display(&paths.lock_path)
        ));
    }

    Ok(RuntimeStatus {
        config_exists: paths.config_path.exists(),
        state_dir_exists: paths.state_dir.exists(),
        journal_count,
        lock_held: paths.lock_path.exists(),
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.journal_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }
    let wrote_config = write_text_file(&paths.config_path, &starter_config(), force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

/// Exclusive marker for the single active run. Removed when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(paths: &ResolvedPaths) -> Result<Self> {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.lock_path)
        {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => bail!(
                "another mediatool run holds {}; delete it if no run is active",
                normalize_for_display(&paths.lock_path)
            ),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to create {}", paths.lock_path.display()));
            }
        };
        writeln!(
            file,
            "pid={}\nstarted_at={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .with_context(|| format!("failed to write {}", paths.lock_path.display()))?;
        debug!(path = %paths.lock_path.display(), "acquired run lock");
        Ok(Self {
            path: paths.lock_path.clone(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
