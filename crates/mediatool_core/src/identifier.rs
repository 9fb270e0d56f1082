use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const GHOST_URL_PLACEHOLDER: &str = "__GHOST_URL__";
pub const IMAGES_PREFIX: &str = "/content/images/";
pub const MEDIA_PREFIX: &str = "/content/media/";
pub const FILES_PREFIX: &str = "/content/files/";
pub const CONTENT_PREFIXES: [&str; 3] = [IMAGES_PREFIX, MEDIA_PREFIX, FILES_PREFIX];

static RENDITION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:size/w\d+(?:h\d+)?/)?(?:format/[A-Za-z0-9]+/)?").expect("valid regex")
});

/// Canonical key for one media asset location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for paths under one of the Ghost content roots.
    pub fn is_site_asset(&self) -> bool {
        CONTENT_PREFIXES
            .iter()
            .any(|prefix| self.0.starts_with(prefix))
    }

    pub fn content_prefix(&self) -> Option<&'static str> {
        CONTENT_PREFIXES
            .iter()
            .copied()
            .find(|prefix| self.0.starts_with(prefix))
    }

    /// Path below the content root, e.g. `2024/01/a.jpg`.
    pub fn relative_path(&self) -> Option<&str> {
        self.content_prefix()
            .map(|prefix| &self.0[prefix.len()..])
    }

    /// Rendition segments (`size/w600/`, `format/webp/`) directly below the images root.
    pub fn rendition_prefix(&self) -> &str {
        let Some(rest) = self.0.strip_prefix(IMAGES_PREFIX) else {
            return "";
        };
        RENDITION_PREFIX
            .find(rest)
            .map(|found| found.as_str())
            .unwrap_or("")
    }

    pub fn is_rendition(&self) -> bool {
        !self.rendition_prefix().is_empty()
    }

    pub fn base_asset(&self) -> Identifier {
        let prefix = self.rendition_prefix();
        if prefix.is_empty() {
            return self.clone();
        }
        let rest = &self.0[IMAGES_PREFIX.len() + prefix.len()..];
        Identifier(format!("{IMAGES_PREFIX}{rest}"))
    }

    /// Applies a rendition prefix to a base image identifier.
    pub fn with_rendition(&self, prefix: &str) -> Identifier {
        if prefix.is_empty() || self.is_rendition() {
            return self.clone();
        }
        match self.0.strip_prefix(IMAGES_PREFIX) {
            Some(rest) => Identifier(format!("{IMAGES_PREFIX}{prefix}{rest}")),
            None => self.clone(),
        }
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(index) => &self.0[..=index],
            None => "",
        }
    }

    pub fn stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(index) if index > 0 => &name[..index],
            _ => name,
        }
    }

    /// Extension without the dot, as written.
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(index) if index > 0 && index + 1 < name.len() => Some(&name[index + 1..]),
            _ => None,
        }
    }

    pub fn with_file_name(&self, file_name: &str) -> Identifier {
        Identifier(format!("{}{file_name}", self.parent()))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceForm {
    RelativePath,
    AbsoluteUrl,
    Placeholder,
}

impl ReferenceForm {
    pub fn of(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with(GHOST_URL_PLACEHOLDER) {
            Self::Placeholder
        } else if trimmed.contains("://") || trimmed.starts_with("//") {
            Self::AbsoluteUrl
        } else {
            Self::RelativePath
        }
    }
}

/// Maps raw references to Identifiers for one configured site.
#[derive(Debug, Clone)]
pub struct Resolver {
    site_url: String,
    host: String,
    port: Option<u16>,
    site_path: String,
}

impl Resolver {
    pub fn new(site_url: &str) -> Result<Self> {
        let trimmed = site_url.trim();
        if trimmed.is_empty() {
            bail!("site URL is empty");
        }
        let parsed =
            Url::parse(trimmed).with_context(|| format!("invalid site URL: {trimmed}"))?;
        let Some(host) = parsed.host_str() else {
            bail!("site URL has no host: {trimmed}");
        };
        let site_path = parsed.path().trim_end_matches('/').to_string();
        let site_url = format!(
            "{}://{}{}",
            parsed.scheme(),
            authority(host, parsed.port()),
            site_path
        );
        Ok(Self {
            site_url,
            host: host.to_ascii_lowercase(),
            port: parsed.port_or_known_default(),
            site_path,
        })
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    /// Total: anything unrecognized passes through with best-effort path cleanup.
    pub fn normalize(&self, raw: &str) -> Identifier {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Identifier(String::new());
        }

        let path = if let Some(rest) = trimmed.strip_prefix(GHOST_URL_PLACEHOLDER) {
            rest.to_string()
        } else if trimmed.contains("://") || trimmed.starts_with("//") {
            match self.site_relative_path(trimmed) {
                Some(path) => path,
                None => return Identifier(strip_query_and_fragment(trimmed).to_string()),
            }
        } else {
            self.strip_site_path(strip_query_and_fragment(trimmed))
                .to_string()
        };

        let path = strip_query_and_fragment(&path);
        let decoded = urlencoding::decode(path)
            .map(|value| value.into_owned())
            .unwrap_or_else(|_| path.to_string());
        Identifier(clean_path(&decoded))
    }

    pub fn denormalize(&self, identifier: &Identifier, form: ReferenceForm) -> String {
        if !identifier.as_str().starts_with('/') {
            return identifier.as_str().to_string();
        }
        let encoded = encode_path(identifier.as_str());
        match form {
            ReferenceForm::RelativePath => format!("{}{encoded}", self.site_path),
            ReferenceForm::AbsoluteUrl => format!("{}{encoded}", self.site_url),
            ReferenceForm::Placeholder => format!("{GHOST_URL_PLACEHOLDER}{encoded}"),
        }
    }

    /// Re-emits `new_value` in the form `old_raw` was written in. The old query is
    /// dropped, a query on `new_value` is kept, and the rendition prefix of
    /// `old_raw` carries over to a base target.
    pub fn substitute(&self, old_raw: &str, new_value: &str) -> String {
        let form = ReferenceForm::of(old_raw);
        let old = self.normalize(old_raw);
        let mut target = self.normalize(new_value);
        if !target.is_rendition() {
            target = target.with_rendition(old.rendition_prefix());
        }
        let query = new_value
            .split_once('?')
            .map(|(_, query)| query.split('#').next().unwrap_or(query))
            .filter(|query| !query.is_empty());
        let mut out = self.denormalize(&target, form);
        if let Some(query) = query {
            out.push('?');
            out.push_str(query);
        }
        out
    }

    fn site_relative_path(&self, raw: &str) -> Option<String> {
        let absolute = if raw.starts_with("//") {
            format!("https:{raw}")
        } else {
            raw.to_string()
        };
        let parsed = Url::parse(&absolute).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        if host != self.host {
            return None;
        }
        let port = parsed.port_or_known_default();
        if parsed.port().is_some() && port != self.port {
            return None;
        }
        Some(self.strip_site_path(parsed.path()).to_string())
    }

    fn strip_site_path<'a>(&self, path: &'a str) -> &'a str {
        if self.site_path.is_empty() {
            return path;
        }
        match path.strip_prefix(self.site_path.as_str()) {
            Some(rest) if rest.starts_with("/content/") => rest,
            _ => path,
        }
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn strip_query_and_fragment(value: &str) -> &str {
    let end = value.find(['?', '#']).unwrap_or(value.len());
    &value[..end]
}

fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute || joined.starts_with("content/") {
        format!("/{joined}")
    } else {
        joined
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'-' | b'.'
                    | b'_'
                    | b'~'
                    | b'!'
                    | b'$'
                    | b'&'
                    | b'\''
                    | b'('
                    | b')'
                    | b'*'
                    | b'+'
                    | b','
                    | b';'
                    | b'='
                    | b':'
                    | b'@'
            );
        if keep {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        Resolver::new("https://blog.example.com").expect("resolver")
    }

    #[test]
    fn all_raw_forms_normalize_identically() {
        let resolver = resolver();
        let expected = Identifier::new("/content/images/2024/01/sunset beach.jpg");
        for raw in [
            "/content/images/2024/01/sunset%20beach.jpg",
            "https://blog.example.com/content/images/2024/01/sunset%20beach.jpg",
            "HTTP://Blog.Example.com/content/images/2024/01/sunset%20beach.jpg?v=3",
            "//blog.example.com/content/images/2024//01/./sunset%20beach.jpg",
            "__GHOST_URL__/content/images/2024/01/sunset%20beach.jpg#top",
            "/content/images/2024/02/../01/sunset beach.jpg",
        ] {
            assert_eq!(resolver.normalize(raw), expected, "raw form {raw}");
        }
    }

    #[test]
    fn round_trips_through_every_form() {
        let resolver = Resolver::new("https://example.com/blog/").expect("resolver");
        for raw in [
            "/blog/content/images/2024/01/a b(1).jpg",
            "https://example.com/blog/content/images/size/w600/2024/01/caf%C3%A9.png",
            "__GHOST_URL__/content/media/2024/01/clip%3F.mp4",
            "https://cdn.other.net/content/images/x.jpg",
        ] {
            let id = resolver.normalize(raw);
            for form in [
                ReferenceForm::RelativePath,
                ReferenceForm::AbsoluteUrl,
                ReferenceForm::Placeholder,
            ] {
                let emitted = resolver.denormalize(&id, form);
                assert_eq!(resolver.normalize(&emitted), id, "{raw} via {form:?}");
            }
        }
    }

    #[test]
    fn external_hosts_never_become_site_assets() {
        let resolver = resolver();
        let id = resolver.normalize("https://images.unsplash.com/photo-1?w=2000");
        assert_eq!(id.as_str(), "https://images.unsplash.com/photo-1");
        assert!(!id.is_site_asset());
    }

    #[test]
    fn base_asset_strips_rendition_segments() {
        let resolver = resolver();
        let id = resolver.normalize("/content/images/size/w600h400/format/webp/2024/01/a.jpg");
        assert!(id.is_rendition());
        assert_eq!(id.rendition_prefix(), "size/w600h400/format/webp/");
        assert_eq!(id.base_asset().as_str(), "/content/images/2024/01/a.jpg");
        assert_eq!(
            id.base_asset().with_rendition("size/w600/").as_str(),
            "/content/images/size/w600/2024/01/a.jpg"
        );
        let plain = Identifier::new("/content/images/sizes/a.jpg");
        assert!(!plain.is_rendition());
    }

    #[test]
    fn substitute_keeps_form_and_rendition() {
        let resolver = resolver();
        assert_eq!(
            resolver.substitute(
                "https://blog.example.com/content/images/size/w1000/2024/01/a.jpg?v=1",
                "/content/images/2024/01/a.webp"
            ),
            "https://blog.example.com/content/images/size/w1000/2024/01/a.webp"
        );
        assert_eq!(
            resolver.substitute("__GHOST_URL__/content/images/a.jpg", "/content/images/a b.webp?v=2"),
            "__GHOST_URL__/content/images/a%20b.webp?v=2"
        );
        assert_eq!(
            resolver.substitute("/content/images/a.jpg", "/content/images/post/post-1.jpg"),
            "/content/images/post/post-1.jpg"
        );
    }

    #[test]
    fn name_parts_preserve_case() {
        let id = Identifier::new("/content/images/2024/Photo.Final.JPG");
        assert_eq!(id.file_name(), "Photo.Final.JPG");
        assert_eq!(id.stem(), "Photo.Final");
        assert_eq!(id.extension(), Some("JPG"));
        assert_eq!(id.parent(), "/content/images/2024/");
        assert_eq!(id.relative_path(), Some("2024/Photo.Final.JPG"));
        assert_eq!(
            id.with_file_name("Photo.Final.webp").as_str(),
            "/content/images/2024/Photo.Final.webp"
        );
    }
}
