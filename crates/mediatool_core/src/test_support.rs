//! In-memory collaborators shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};

use crate::api::{ApiError, ContentApi, ItemPage};
use crate::confirm::Confirm;
use crate::content::{ContentItem, ItemKind, SettingEntry, SiteSettings};
use crate::convert::ImageCodec;
use crate::filesystem::{MediaLibrary, MediaRoot};
use crate::identifier::{IMAGES_PREFIX, Identifier, MEDIA_PREFIX, Resolver};

pub(crate) const SITE_URL: &str = "https://blog.example.com";

const SETTINGS_KEY: &str = "settings";

#[derive(Default)]
pub(crate) struct MemoryContentApi {
    posts: Vec<Value>,
    pages: Vec<Value>,
    settings: SiteSettings,
    listing_failure: Option<ApiError>,
    patch_failures: BTreeMap<String, VecDeque<ApiError>>,
    patched: Vec<String>,
    list_calls: usize,
    requests: usize,
    version: u64,
}

impl MemoryContentApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_post(&mut self, value: Value) {
        let value = self.stamp(value);
        self.posts.push(value);
    }

    pub(crate) fn add_page(&mut self, value: Value) {
        let value = self.stamp(value);
        self.pages.push(value);
    }

    pub(crate) fn set_setting(&mut self, key: &str, value: Value) {
        match self.settings.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => self.settings.entries.push(SettingEntry {
                key: key.to_string(),
                value,
            }),
        }
    }

    pub(crate) fn fail_listing(&mut self, error: ApiError) {
        self.listing_failure = Some(error);
    }

    /// Queues errors returned by the next patches of item `id`, or of the
    /// settings when `id` is `"settings"`.
    pub(crate) fn fail_patch(&mut self, id: &str, errors: impl IntoIterator<Item = ApiError>) {
        self.patch_failures
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    pub(crate) fn item(&self, kind: ItemKind, id: &str) -> ContentItem {
        let value = self
            .collection(kind)
            .iter()
            .find(|value| value["id"] == id)
            .cloned()
            .expect("item exists");
        ContentItem::from_value(kind, value).expect("item decodes")
    }

    pub(crate) fn settings(&self) -> &SiteSettings {
        &self.settings
    }

    pub(crate) fn patched(&self) -> &[String] {
        &self.patched
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls
    }

    fn stamp(&mut self, mut value: Value) -> Value {
        if let Some(object) = value.as_object_mut()
            && !object.contains_key("updated_at")
        {
            self.version += 1;
            object.insert("updated_at".to_string(), json!(format!("v{}", self.version)));
        }
        value
    }

    fn collection(&self, kind: ItemKind) -> &Vec<Value> {
        match kind {
            ItemKind::Post => &self.posts,
            ItemKind::Page => &self.pages,
        }
    }

    fn collection_mut(&mut self, kind: ItemKind) -> &mut Vec<Value> {
        match kind {
            ItemKind::Post => &mut self.posts,
            ItemKind::Page => &mut self.pages,
        }
    }

    fn next_failure(&mut self, id: &str) -> Option<ApiError> {
        self.patch_failures
            .get_mut(id)
            .and_then(VecDeque::pop_front)
    }
}

impl ContentApi for MemoryContentApi {
    fn list_items(&mut self, kind: ItemKind, page: u32, limit: u32) -> Result<ItemPage, ApiError> {
        self.requests += 1;
        self.list_calls += 1;
        if let Some(error) = self.listing_failure.take() {
            return Err(error);
        }
        let limit = limit.max(1) as usize;
        let start = (page.saturating_sub(1) as usize) * limit;
        let items = self.collection(kind);
        let slice: Vec<Value> = items.iter().skip(start).take(limit).cloned().collect();
        let next_page = (start + limit < items.len()).then_some(page + 1);
        Ok(ItemPage {
            items: slice,
            next_page,
        })
    }

    fn fetch_item(&mut self, kind: ItemKind, id: &str) -> Result<ContentItem, ApiError> {
        self.requests += 1;
        let value = self
            .collection(kind)
            .iter()
            .find(|value| value["id"] == id)
            .cloned()
            .ok_or_else(|| ApiError::Http {
                status: 404,
                message: format!("{} {id} not found", kind.as_str()),
            })?;
        ContentItem::from_value(kind, value).map_err(|error| ApiError::Decode(format!("{error:#}")))
    }

    fn patch_item(&mut self, item: &ContentItem) -> Result<ContentItem, ApiError> {
        self.requests += 1;
        if let Some(error) = self.next_failure(&item.id) {
            return Err(error);
        }
        self.version += 1;
        let version = self.version;
        let kind = item.kind;
        let stored = self
            .collection_mut(kind)
            .iter_mut()
            .find(|value| value["id"] == item.id.as_str())
            .ok_or_else(|| ApiError::Http {
                status: 404,
                message: format!("{} {} not found", kind.as_str(), item.id),
            })?;
        if stored.get("updated_at").and_then(Value::as_str) != item.updated_at.as_deref() {
            return Err(ApiError::Transient(
                "HTTP 409: Saving failed! Someone else is editing this post.".to_string(),
            ));
        }
        let mut value = item
            .to_value()
            .map_err(|error| ApiError::Decode(format!("{error:#}")))?;
        value["updated_at"] = json!(format!("v{version}"));
        *stored = value.clone();
        self.patched.push(item.id.clone());
        ContentItem::from_value(kind, value).map_err(|error| ApiError::Decode(format!("{error:#}")))
    }

    fn fetch_settings(&mut self) -> Result<SiteSettings, ApiError> {
        self.requests += 1;
        Ok(self.settings.clone())
    }

    fn patch_settings(&mut self, entries: &[SettingEntry]) -> Result<SiteSettings, ApiError> {
        self.requests += 1;
        if let Some(error) = self.next_failure(SETTINGS_KEY) {
            return Err(error);
        }
        for entry in entries {
            self.set_setting(&entry.key, entry.value.clone());
        }
        self.patched.push(SETTINGS_KEY.to_string());
        Ok(self.settings.clone())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

/// Codec that tags its input instead of encoding; inputs starting with
/// `corrupt` fail.
pub(crate) struct StubCodec;

impl ImageCodec for StubCodec {
    fn target_extension(&self) -> &'static str {
        "webp"
    }

    fn encode(&self, source: &[u8], quality: u8) -> Result<Vec<u8>> {
        if source.starts_with(b"corrupt") {
            bail!("failed to decode source image");
        }
        let mut out = format!("WEBP q{quality}:").into_bytes();
        out.extend_from_slice(source);
        Ok(out)
    }
}

/// Temporary Ghost content directory with images and media roots.
pub(crate) struct SiteFixture {
    pub temp: TempDir,
    pub library: MediaLibrary,
    pub resolver: Resolver,
}

impl SiteFixture {
    pub(crate) fn new() -> Self {
        let temp = tempdir().expect("tempdir");
        let library = MediaLibrary::new(vec![
            MediaRoot {
                prefix: IMAGES_PREFIX,
                dir: temp.path().join("content/images"),
            },
            MediaRoot {
                prefix: MEDIA_PREFIX,
                dir: temp.path().join("content/media"),
            },
        ]);
        fs::create_dir_all(temp.path().join("content/images")).expect("images dir");
        let resolver = Resolver::new(SITE_URL).expect("resolver");
        Self {
            temp,
            library,
            resolver,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.temp.path()
    }

    pub(crate) fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub(crate) fn path(&self, identifier: &str) -> PathBuf {
        self.library
            .path_for(&Identifier::new(identifier))
            .expect("identifier maps to a path")
    }

    pub(crate) fn write(&self, identifier: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(identifier);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(&path, bytes).expect("write asset");
        path
    }

    /// Identifiers of every file currently on disk, sorted.
    pub(crate) fn identifiers(&self) -> Vec<String> {
        self.library
            .list_assets(&self.resolver)
            .expect("list assets")
            .files
            .into_iter()
            .filter_map(|file| file.identifier)
            .map(|identifier| identifier.to_string())
            .collect()
    }
}

/// Confirmation with scripted answers; runs out as "no".
pub(crate) struct ScriptedConfirm {
    answers: VecDeque<bool>,
    pub prompts: Vec<String>,
}

impl ScriptedConfirm {
    pub(crate) fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            prompts: Vec::new(),
        }
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.prompts.push(prompt.to_string());
        Ok(self.answers.pop_front().unwrap_or(false))
    }
}
