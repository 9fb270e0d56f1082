use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use crate::config::MediaToolConfig;
use crate::filesystem::display_path;

pub const BACKUPS_DIRNAME: &str = "backups";

/// One artifact-producing backup step.
pub trait BackupStep {
    fn name(&self) -> &'static str;
    /// What the step would do, for dry runs.
    fn describe(&self, backup_dir: &Path, stamp: &str) -> String;
    fn run(&self, backup_dir: &Path, stamp: &str) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct DatabaseDump {
    pub command: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl DatabaseDump {
    fn artifact(backup_dir: &Path, stamp: &str) -> PathBuf {
        backup_dir.join(format!("db_backup_{stamp}.sql"))
    }

    fn arguments(&self) -> Vec<String> {
        let mut args = vec!["--single-transaction".to_string()];
        if let Some(host) = &self.host {
            args.push(format!("--host={host}"));
        }
        if let Some(port) = self.port {
            args.push(format!("--port={port}"));
        }
        if let Some(user) = &self.user {
            args.push(format!("--user={user}"));
        }
        args.push(self.database.clone());
        args
    }
}

impl BackupStep for DatabaseDump {
    fn name(&self) -> &'static str {
        "database"
    }

    fn describe(&self, backup_dir: &Path, stamp: &str) -> String {
        format!(
            "{} {} > {}",
            self.command,
            self.arguments().join(" "),
            display_path(&Self::artifact(backup_dir, stamp))
        )
    }

    /// The password travels in `MYSQL_PWD`, never on the command line. A
    /// failed dump leaves no file behind.
    fn run(&self, backup_dir: &Path, stamp: &str) -> Result<PathBuf> {
        let target = Self::artifact(backup_dir, stamp);
        let file =
            File::create(&target).with_context(|| format!("failed to create {}", target.display()))?;
        let mut command = Command::new(&self.command);
        command
            .args(self.arguments())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped());
        if let Some(password) = &self.password {
            command.env("MYSQL_PWD", password);
        }

        let outcome = command
            .output()
            .with_context(|| format!("failed to execute {}", self.command));
        let output = match outcome {
            Ok(output) => output,
            Err(error) => {
                let _ = fs::remove_file(&target);
                return Err(error);
            }
        };
        if !output.status.success() {
            let _ = fs::remove_file(&target);
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveStrategy {
    TarPigz,
    TarGzip,
    Zip,
}

impl ArchiveStrategy {
    /// Probes the tools once: `tar` piped through `pigz` when both exist,
    /// `tar -z` otherwise, an in-process zip when there is no `tar`.
    pub fn detect() -> Self {
        if !tool_available("tar") {
            return Self::Zip;
        }
        if tool_available("pigz") {
            Self::TarPigz
        } else {
            Self::TarGzip
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TarPigz => "tar+pigz",
            Self::TarGzip => "tar+gzip",
            Self::Zip => "zip",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::TarPigz | Self::TarGzip => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ContentArchive {
    pub source: PathBuf,
    pub strategy: ArchiveStrategy,
}

impl ContentArchive {
    fn artifact(&self, backup_dir: &Path, stamp: &str) -> PathBuf {
        backup_dir.join(format!("ghost_backup_{stamp}.{}", self.strategy.extension()))
    }

    fn split_source(&self) -> Result<(&Path, &std::ffi::OsStr)> {
        let parent = self
            .source
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{} has no parent", self.source.display()))?;
        let name = self
            .source
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", self.source.display()))?;
        Ok((parent, name))
    }

    fn write_tar_gzip(&self, target: &Path) -> Result<()> {
        let (parent, name) = self.split_source()?;
        let status = Command::new("tar")
            .arg("-czf")
            .arg(target)
            .arg("-C")
            .arg(parent)
            .arg(name)
            .status()
            .context("failed to execute tar")?;
        if !status.success() {
            bail!("tar exited with {}", status.code().unwrap_or(1));
        }
        Ok(())
    }

    fn write_tar_pigz(&self, target: &Path) -> Result<()> {
        let (parent, name) = self.split_source()?;
        let output =
            File::create(target).with_context(|| format!("failed to create {}", target.display()))?;
        let mut tar = Command::new("tar")
            .arg("-cf")
            .arg("-")
            .arg("-C")
            .arg(parent)
            .arg(name)
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to execute tar")?;
        let tar_stdout = tar
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("tar stdout was not captured"))?;
        let pigz = Command::new("pigz")
            .stdin(Stdio::from(tar_stdout))
            .stdout(Stdio::from(output))
            .status()
            .context("failed to execute pigz");
        let tar_status = tar.wait().context("failed to wait for tar")?;
        let pigz = pigz?;
        if !tar_status.success() || !pigz.success() {
            bail!(
                "archive pipeline failed (tar {}, pigz {})",
                tar_status.code().unwrap_or(1),
                pigz.code().unwrap_or(1)
            );
        }
        Ok(())
    }

    fn write_zip(&self, target: &Path) -> Result<()> {
        let (parent, _) = self.split_source()?;
        let file =
            File::create(target).with_context(|| format!("failed to create {}", target.display()))?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for entry in WalkDir::new(&self.source).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to walk {}", self.source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(parent)
                .with_context(|| format!("{} escaped the archive root", entry.path().display()))?;
            writer
                .start_file(display_path(relative), options)
                .with_context(|| format!("failed to add {} to archive", relative.display()))?;
            let mut source = File::open(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            io::copy(&mut source, &mut writer)
                .with_context(|| format!("failed to archive {}", entry.path().display()))?;
        }
        writer.finish().context("failed to finish zip archive")?;
        Ok(())
    }
}

impl BackupStep for ContentArchive {
    fn name(&self) -> &'static str {
        "content"
    }

    fn describe(&self, backup_dir: &Path, stamp: &str) -> String {
        format!(
            "archive {} ({}) > {}",
            display_path(&self.source),
            self.strategy.as_str(),
            display_path(&self.artifact(backup_dir, stamp))
        )
    }

    fn run(&self, backup_dir: &Path, stamp: &str) -> Result<PathBuf> {
        if !self.source.is_dir() {
            bail!("content directory not found: {}", self.source.display());
        }
        let target = self.artifact(backup_dir, stamp);
        let result = match self.strategy {
            ArchiveStrategy::TarPigz => self.write_tar_pigz(&target),
            ArchiveStrategy::TarGzip => self.write_tar_gzip(&target),
            ArchiveStrategy::Zip => self.write_zip(&target),
        };
        if let Err(error) = result {
            let _ = fs::remove_file(&target);
            return Err(error);
        }
        Ok(target)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub step: &'static str,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    pub dry_run: bool,
    pub backup_dir: PathBuf,
    pub artifacts: Vec<BackupArtifact>,
    pub planned: Vec<String>,
}

pub struct BackupOrchestrator {
    backup_dir: PathBuf,
    steps: Vec<Box<dyn BackupStep>>,
}

impl BackupOrchestrator {
    pub fn new(backup_dir: PathBuf, steps: Vec<Box<dyn BackupStep>>) -> Self {
        Self { backup_dir, steps }
    }

    /// Database dump when `[database].name` is set, content archive when a
    /// content directory is known. `default_dir` is used without `[paths].backup_dir`.
    pub fn from_config(config: &MediaToolConfig, default_dir: &Path) -> Result<Self> {
        let backup_dir = config
            .paths
            .backup_dir
            .clone()
            .unwrap_or_else(|| default_dir.to_path_buf());
        let mut steps: Vec<Box<dyn BackupStep>> = Vec::new();
        if config.database_configured() {
            steps.push(Box::new(DatabaseDump {
                command: config.dump_command(),
                host: config.database.host.clone(),
                port: config.database.port,
                user: config.database.user.clone(),
                password: config.database_password(),
                database: config.database.name.clone().unwrap_or_default(),
            }));
        } else {
            warn!("no [database].name configured; skipping database dump");
        }
        if let Some(source) = config.archive_source() {
            steps.push(Box::new(ContentArchive {
                source,
                strategy: ArchiveStrategy::detect(),
            }));
        }
        if steps.is_empty() {
            bail!("nothing to back up: configure [database] or [paths].ghost_root");
        }
        Ok(Self::new(backup_dir, steps))
    }

    /// Runs every step in order and stops at the first failure.
    pub fn run(&self, dry_run: bool) -> Result<BackupReport> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut report = BackupReport {
            dry_run,
            backup_dir: self.backup_dir.clone(),
            ..BackupReport::default()
        };
        if dry_run {
            for step in &self.steps {
                report.planned.push(step.describe(&self.backup_dir, &stamp));
            }
            return Ok(report);
        }

        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("failed to create {}", self.backup_dir.display()))?;
        for step in &self.steps {
            info!(step = step.name(), "running backup step");
            let path = step
                .run(&self.backup_dir, &stamp)
                .with_context(|| format!("{} backup failed", step.name()))?;
            let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            info!(step = step.name(), path = %path.display(), size, "backup written");
            report.artifacts.push(BackupArtifact {
                step: step.name(),
                path,
                size,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use tempfile::tempdir;

    use super::*;

    struct CountingStep {
        calls: Rc<Cell<usize>>,
        fail: bool,
    }

    impl BackupStep for CountingStep {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn describe(&self, backup_dir: &Path, stamp: &str) -> String {
            format!("count into {}/{stamp}", backup_dir.display())
        }

        fn run(&self, backup_dir: &Path, stamp: &str) -> Result<PathBuf> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                bail!("disk full");
            }
            let path = backup_dir.join(format!("count_{stamp}.txt"));
            fs::write(&path, b"ok")?;
            Ok(path)
        }
    }

    #[test]
    fn dry_run_describes_without_running() {
        let temp = tempdir().expect("tempdir");
        let calls = Rc::new(Cell::new(0));
        let orchestrator = BackupOrchestrator::new(
            temp.path().join("backups"),
            vec![Box::new(CountingStep {
                calls: Rc::clone(&calls),
                fail: false,
            })],
        );
        let report = orchestrator.run(true).expect("dry run");
        assert_eq!(calls.get(), 0);
        assert_eq!(report.planned.len(), 1);
        assert!(!temp.path().join("backups").exists());
    }

    #[test]
    fn failing_step_stops_the_run() {
        let temp = tempdir().expect("tempdir");
        let calls = Rc::new(Cell::new(0));
        let orchestrator = BackupOrchestrator::new(
            temp.path().join("backups"),
            vec![
                Box::new(CountingStep {
                    calls: Rc::clone(&calls),
                    fail: true,
                }),
                Box::new(CountingStep {
                    calls: Rc::clone(&calls),
                    fail: false,
                }),
            ],
        );
        let error = orchestrator.run(false).expect_err("must fail");
        assert!(format!("{error:#}").contains("disk full"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zip_archive_contains_the_content_tree() {
        let temp = tempdir().expect("tempdir");
        let ghost = temp.path().join("ghost");
        fs::create_dir_all(ghost.join("content/images/2024")).expect("dirs");
        fs::write(ghost.join("content/images/2024/a.jpg"), b"jpeg").expect("write");
        fs::write(ghost.join("config.production.json"), b"{}").expect("write");
        let archive = ContentArchive {
            source: ghost,
            strategy: ArchiveStrategy::Zip,
        };
        let backups = temp.path().join("backups");
        fs::create_dir_all(&backups).expect("backups");

        let path = archive.run(&backups, "20240101_000000").expect("archive");
        assert!(path.ends_with("ghost_backup_20240101_000000.zip"));
        let mut reader = zip::ZipArchive::new(File::open(&path).expect("open")).expect("zip");
        let mut names: Vec<String> = (0..reader.len())
            .map(|index| reader.by_index(index).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["ghost/config.production.json", "ghost/content/images/2024/a.jpg"]
        );
    }

    #[test]
    fn missing_dump_command_leaves_no_partial_file() {
        let temp = tempdir().expect("tempdir");
        let dump = DatabaseDump {
            command: "mediatool-test-missing-dump".to_string(),
            host: Some("localhost".to_string()),
            port: Some(3306),
            user: Some("ghost".to_string()),
            password: Some("secret".to_string()),
            database: "ghost_production".to_string(),
        };
        assert!(!dump.describe(temp.path(), "x").contains("secret"));
        assert!(dump.run(temp.path(), "20240101_000000").is_err());
        assert!(!temp.path().join("db_backup_20240101_000000.sql").exists());
    }

    #[test]
    fn from_config_requires_something_to_back_up() {
        let temp = tempdir().expect("tempdir");
        let config = MediaToolConfig::default();
        assert!(BackupOrchestrator::from_config(&config, temp.path()).is_err());
    }
}
