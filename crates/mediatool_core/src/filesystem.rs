use std::fs;
use std::path::{Component, MAIN_SEPARATOR_STR, Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::MediaToolConfig;
use crate::identifier::{FILES_PREFIX, IMAGES_PREFIX, Identifier, MEDIA_PREFIX, Resolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRoot {
    pub prefix: &'static str,
    pub dir: PathBuf,
}

/// The configured content directories and the identifier prefix each serves.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    roots: Vec<MediaRoot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub identifier: Option<Identifier>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetListing {
    pub files: Vec<AssetFile>,
}

impl AssetListing {
    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.files
            .iter()
            .any(|file| file.identifier.as_ref() == Some(identifier))
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

impl MediaLibrary {
    pub fn new(roots: Vec<MediaRoot>) -> Self {
        Self { roots }
    }

    pub fn from_config(config: &MediaToolConfig) -> Result<Self> {
        let roots: Vec<MediaRoot> = [
            (IMAGES_PREFIX, config.images_dir()),
            (MEDIA_PREFIX, config.media_dir()),
            (FILES_PREFIX, config.files_dir()),
        ]
        .into_iter()
        .filter_map(|(prefix, dir)| dir.map(|dir| MediaRoot { prefix, dir }))
        .collect();
        if roots.is_empty() {
            bail!("no media directories configured (set [paths].ghost_root or [paths].images)");
        }
        Ok(Self::new(roots))
    }

    pub fn roots(&self) -> &[MediaRoot] {
        &self.roots
    }

    pub fn root_for(&self, identifier: &Identifier) -> Option<&MediaRoot> {
        self.roots
            .iter()
            .find(|root| identifier.as_str().starts_with(root.prefix))
    }

    /// Disk names are literal, so each segment is encoded before it goes
    /// through the reference normalizer that decodes it again.
    pub fn identifier_for(&self, path: &Path, resolver: &Resolver) -> Option<Identifier> {
        for root in &self.roots {
            let Ok(relative) = path.strip_prefix(&root.dir) else {
                continue;
            };
            let mut segments = Vec::new();
            for component in relative.components() {
                match component {
                    Component::Normal(part) => segments.push(urlencoding::encode(part.to_str()?)),
                    _ => return None,
                }
            }
            if segments.is_empty() {
                return None;
            }
            return Some(resolver.normalize(&format!("{}{}", root.prefix, segments.join("/"))));
        }
        None
    }

    pub fn path_for(&self, identifier: &Identifier) -> Option<PathBuf> {
        let root = self.root_for(identifier)?;
        let relative = &identifier.as_str()[root.prefix.len()..];
        let mut path = root.dir.clone();
        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }

    /// Walks every root without following links. Files come back sorted by
    /// path; duplicate identifiers are kept for the planners to resolve.
    pub fn list_assets(&self, resolver: &Resolver) -> Result<AssetListing> {
        let mut files = Vec::new();
        for root in &self.roots {
            if !root.dir.exists() {
                warn!(dir = %root.dir.display(), "media directory does not exist");
                continue;
            }
            for entry in WalkDir::new(&root.dir).follow_links(false) {
                let entry =
                    entry.with_context(|| format!("failed to walk {}", root.dir.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .with_context(|| format!("failed to inspect {}", entry.path().display()))?;
                let path = entry.path().to_path_buf();
                files.push(AssetFile {
                    identifier: self.identifier_for(&path, resolver),
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    path,
                });
            }
        }
        files.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(AssetListing { files })
    }

    pub fn validate_scoped_path(&self, candidate: &Path, extra_roots: &[&Path]) -> Result<()> {
        let normalized = normalize_pathbuf(candidate);
        let allowed: Vec<PathBuf> = self
            .roots
            .iter()
            .map(|root| normalize_pathbuf(&root.dir))
            .chain(extra_roots.iter().map(|root| normalize_pathbuf(root)))
            .collect();
        if allowed.iter().any(|prefix| normalized.starts_with(prefix)) {
            return Ok(());
        }
        bail!(
            "path escapes the media directories: {}\nallowed roots:\n{}",
            display_path(&normalized),
            allowed
                .iter()
                .map(|root| format!("  - {}", display_path(root)))
                .collect::<Vec<_>>()
                .join("\n")
        )
    }
}

/// Moves a file, creating the destination's parent. Refuses to replace an
/// existing destination unless `overwrite` is set.
pub fn move_file(from: &Path, to: &Path, overwrite: bool) -> Result<()> {
    if to.exists() && !overwrite {
        bail!("refusing to overwrite existing file {}", display_path(to));
    }
    ensure_parent_dir(to)?;
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| {
        format!("failed to copy {} to {}", from.display(), to.display())
    })?;
    fs::remove_file(from).with_context(|| format!("failed to remove {}", from.display()))?;
    Ok(())
}

/// Writes through a sibling temporary file so a partial target is never visible.
pub fn write_new_file(path: &Path, bytes: &[u8], overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        bail!("refusing to overwrite existing file {}", display_path(path));
    }
    ensure_parent_dir(path)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let partial = path.with_file_name(format!(".{file_name}.partial"));
    fs::write(&partial, bytes).with_context(|| format!("failed to write {}", partial.display()))?;
    if let Err(error) = fs::rename(&partial, path) {
        let _ = fs::remove_file(&partial);
        return Err(error)
            .with_context(|| format!("failed to move {} into place", partial.display()));
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))
}

pub fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut output = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => output.push(prefix.as_os_str()),
            Component::RootDir => output.push(Path::new(MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                output.pop();
            }
            Component::Normal(part) => output.push(part),
        }
    }
    output
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
