use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identifier::{Identifier, Resolver};

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(data-srcset|data-src|srcset|src|href|poster|content)\s*=\s*(?:"([^"]*)"|'([^']*)')"#,
    )
    .expect("valid regex")
});
static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^)'"\s]+))\s*\)"#).expect("valid regex")
});
static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]\(\s*<?([^)\s>]+)").expect("valid regex"));
static IMG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));
static ALT_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\balt\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});
static CONTENT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:__GHOST_URL__|https?://[A-Za-z0-9.\-:]+)?(?:/[A-Za-z0-9._~%\-]+)*?/content/(?:images|media|files)/[^\s"'\\<>()?#]+"#,
    )
    .expect("valid regex")
});

/// Item fields holding a single asset URL.
const URL_FIELDS: [&str; 3] = ["feature_image", "og_image", "twitter_image"];
const CODE_INJECTION_FIELDS: [&str; 2] = ["codeinjection_head", "codeinjection_foot"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Post,
    Page,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Post, ItemKind::Page];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Page => "page",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Page => "pages",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Lexical,
    Mobiledoc,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Mobiledoc => "mobiledoc",
        }
    }
}

/// One post or page as returned by the Admin API.
///
/// `updated_at` is the version token the API checks on update. Fields not
/// modelled here are kept in `extra` and sent back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(skip)]
    pub kind: ItemKind,
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lexical: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobiledoc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_image_alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codeinjection_head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codeinjection_foot: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Owner {
    Item {
        kind: ItemKind,
        id: String,
        slug: String,
        status: Option<String>,
    },
    Settings,
}

impl Owner {
    pub fn slug(&self) -> Option<&str> {
        match self {
            Self::Item { slug, .. } => Some(slug),
            Self::Settings => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item { kind, id, slug, .. } => write!(f, "{} {slug} ({id})", kind.as_str()),
            Self::Settings => f.write_str("site settings"),
        }
    }
}

/// Where inside its owner a reference was found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Locator {
    Field {
        name: String,
    },
    /// String value inside a rich-content document, addressed by JSON pointer.
    Node {
        document: DocumentFormat,
        pointer: String,
    },
    /// Nth URL occurrence inside markup. `pointer` is set when the markup is a
    /// string value inside a document named by `field`.
    Markup {
        field: String,
        pointer: Option<String>,
        attribute: String,
        occurrence: usize,
    },
    Setting {
        key: String,
    },
    Unparsed,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field { name } => f.write_str(name),
            Self::Node { document, pointer } => write!(f, "{}:{pointer}", document.as_str()),
            Self::Markup {
                field,
                pointer,
                attribute,
                occurrence,
            } => match pointer {
                Some(pointer) => write!(f, "{field}:{pointer} {attribute}#{occurrence}"),
                None => write!(f, "{field} {attribute}#{occurrence}"),
            },
            Self::Setting { key } => write!(f, "settings.{key}"),
            Self::Unparsed => f.write_str("unparsed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReference {
    pub owner: Owner,
    pub locator: Locator,
    pub raw: String,
    pub identifier: Identifier,
    /// Current alt text when the reference has an alt slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

impl ContentReference {
    pub fn base(&self) -> Identifier {
        self.identifier.base_asset()
    }

    pub fn is_rewritable(&self) -> bool {
        self.locator != Locator::Unparsed
    }
}

struct RawReference {
    locator: Locator,
    raw: String,
    alt: Option<String>,
}

impl ContentItem {
    pub fn from_value(kind: ItemKind, value: Value) -> Result<Self> {
        let mut item: ContentItem =
            serde_json::from_value(value).context("failed to decode content item")?;
        item.kind = kind;
        Ok(item)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to encode content item")
    }

    pub fn owner(&self) -> Owner {
        Owner::Item {
            kind: self.kind,
            id: self.id.clone(),
            slug: self.slug.clone(),
            status: self.status.clone(),
        }
    }

    /// True when the item carries a Lexical or Mobiledoc source document; its
    /// `html` is then derived and never edited directly.
    pub fn has_document(&self) -> bool {
        self.documents().next().is_some()
    }

    fn documents(&self) -> impl Iterator<Item = (DocumentFormat, &str)> {
        [
            (DocumentFormat::Lexical, self.lexical.as_deref()),
            (DocumentFormat::Mobiledoc, self.mobiledoc.as_deref()),
        ]
        .into_iter()
        .filter_map(|(format, text)| {
            text.filter(|text| !text.trim().is_empty())
                .map(|text| (format, text))
        })
    }

    fn document_mut(&mut self, format: DocumentFormat) -> &mut Option<String> {
        match format {
            DocumentFormat::Lexical => &mut self.lexical,
            DocumentFormat::Mobiledoc => &mut self.mobiledoc,
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "feature_image" => self.feature_image.as_deref(),
            "og_image" => self.og_image.as_deref(),
            "twitter_image" => self.twitter_image.as_deref(),
            "html" => self.html.as_deref(),
            "codeinjection_head" => self.codeinjection_head.as_deref(),
            "codeinjection_foot" => self.codeinjection_foot.as_deref(),
            _ => None,
        }
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "feature_image" => Some(&mut self.feature_image),
            "og_image" => Some(&mut self.og_image),
            "twitter_image" => Some(&mut self.twitter_image),
            "html" => Some(&mut self.html),
            "codeinjection_head" => Some(&mut self.codeinjection_head),
            "codeinjection_foot" => Some(&mut self.codeinjection_foot),
            _ => None,
        }
    }

    fn markup_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::with_capacity(3);
        if !self.has_document() {
            fields.push("html");
        }
        fields.extend(CODE_INJECTION_FIELDS);
        fields
    }

    /// Every site asset referenced by this item.
    pub fn references(&self, resolver: &Resolver) -> Result<Vec<ContentReference>> {
        let mut found = Vec::new();
        for name in URL_FIELDS {
            if let Some(value) = self.field(name) {
                let alt = (name == "feature_image")
                    .then(|| self.feature_image_alt.clone().unwrap_or_default());
                found.push(RawReference {
                    locator: Locator::Field {
                        name: name.to_string(),
                    },
                    raw: value.to_string(),
                    alt,
                });
            }
        }
        for (format, text) in self.documents() {
            let document: Value = serde_json::from_str(text).with_context(|| {
                format!("{} document of {} is not valid JSON", format.as_str(), self.owner())
            })?;
            collect_node(&document, "", format, &mut found);
        }
        for name in self.markup_fields() {
            if let Some(text) = self.field(name) {
                for (occurrence, span) in markup_spans(text, false).into_iter().enumerate() {
                    found.push(RawReference {
                        locator: Locator::Markup {
                            field: name.to_string(),
                            pointer: None,
                            attribute: span.attribute,
                            occurrence,
                        },
                        raw: text[span.range].to_string(),
                        alt: span.alt,
                    });
                }
            }
        }

        let owner = self.owner();
        Ok(found
            .into_iter()
            .filter_map(|reference| {
                let identifier = resolver.normalize(&reference.raw);
                identifier.is_site_asset().then(|| ContentReference {
                    owner: owner.clone(),
                    locator: reference.locator,
                    raw: reference.raw,
                    identifier,
                    alt: reference.alt,
                })
            })
            .collect())
    }

    /// Points every occurrence of base asset `from` at `to`, keeping the form
    /// each occurrence was written in. Returns the number of replacements.
    pub fn rewrite_asset(
        &mut self,
        resolver: &Resolver,
        from: &Identifier,
        to: &Identifier,
    ) -> Result<usize> {
        let mut rewrite = |raw: &str| {
            let identifier = resolver.normalize(raw);
            (identifier.is_site_asset() && identifier.base_asset() == *from)
                .then(|| resolver.substitute(raw, to.as_str()))
        };
        let mut count = 0;

        for name in URL_FIELDS {
            if let Some(slot) = self.field_mut(name)
                && let Some(value) = slot.as_mut()
                && let Some(replacement) = rewrite(value.as_str())
            {
                *value = replacement;
                count += 1;
            }
        }

        let formats: Vec<DocumentFormat> = self.documents().map(|(format, _)| format).collect();
        for format in formats {
            let slot = self.document_mut(format);
            let Some(text) = slot.as_mut() else {
                continue;
            };
            let mut document: Value = serde_json::from_str(text)
                .with_context(|| format!("{} document is not valid JSON", format.as_str()))?;
            let changed = rewrite_node(&mut document, "", &mut rewrite);
            if changed > 0 {
                *text = serde_json::to_string(&document)
                    .with_context(|| format!("failed to encode {} document", format.as_str()))?;
                count += changed;
            }
        }

        for name in self.markup_fields() {
            if let Some(slot) = self.field_mut(name)
                && let Some(text) = slot.as_mut()
            {
                let (updated, changed) = rewrite_markup(text, false, &mut rewrite);
                if changed > 0 {
                    *text = updated;
                    count += changed;
                }
            }
        }
        Ok(count)
    }

    /// Sets the alt text of the reference at `locator` after checking it still
    /// points at base asset `expected`.
    pub fn set_alt(
        &mut self,
        resolver: &Resolver,
        locator: &Locator,
        expected: &Identifier,
        alt: &str,
    ) -> Result<()> {
        let points_at_expected = |raw: &str| resolver.normalize(raw).base_asset() == *expected;
        match locator {
            Locator::Field { name } if name == "feature_image" => {
                let current = self.feature_image.as_deref().unwrap_or("");
                if !points_at_expected(current) {
                    bail!("feature_image of {} no longer points to {expected}", self.owner());
                }
                self.feature_image_alt = Some(alt.to_string());
                Ok(())
            }
            Locator::Node { document, pointer } => {
                let owner = self.owner();
                let slot = self.document_mut(*document);
                let text = slot
                    .as_mut()
                    .ok_or_else(|| anyhow!("{owner} has no {} document", document.as_str()))?;
                let mut value: Value = serde_json::from_str(text)
                    .with_context(|| format!("{} document is not valid JSON", document.as_str()))?;
                let current = value.pointer(pointer).and_then(Value::as_str).unwrap_or("");
                if !points_at_expected(current) {
                    bail!("{locator} of {owner} no longer points to {expected}");
                }
                let (parent_pointer, _) = pointer
                    .rsplit_once('/')
                    .ok_or_else(|| anyhow!("{locator} has no parent node"))?;
                let parent = value
                    .pointer_mut(parent_pointer)
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| anyhow!("{locator} has no alt slot"))?;
                parent.insert("alt".to_string(), Value::String(alt.to_string()));
                *text = serde_json::to_string(&value)
                    .with_context(|| format!("failed to encode {} document", document.as_str()))?;
                Ok(())
            }
            Locator::Markup {
                field,
                pointer: Some(pointer),
                occurrence,
                ..
            } => {
                let format = match field.as_str() {
                    "lexical" => DocumentFormat::Lexical,
                    "mobiledoc" => DocumentFormat::Mobiledoc,
                    other => bail!("unknown document field {other}"),
                };
                let owner = self.owner();
                let slot = self.document_mut(format);
                let text = slot
                    .as_mut()
                    .ok_or_else(|| anyhow!("{owner} has no {field} document"))?;
                let mut value: Value = serde_json::from_str(text)
                    .with_context(|| format!("{field} document is not valid JSON"))?;
                let markdown = pointer.ends_with("/markdown");
                let markup = value
                    .pointer_mut(pointer)
                    .ok_or_else(|| anyhow!("{locator} no longer exists in {owner}"))?;
                let Value::String(markup_text) = markup else {
                    bail!("{locator} of {owner} is not markup");
                };
                *markup_text =
                    set_markup_alt(markup_text, markdown, *occurrence, &points_at_expected, alt)
                        .with_context(|| format!("failed to set alt at {locator} of {owner}"))?;
                *text = serde_json::to_string(&value)
                    .with_context(|| format!("failed to encode {field} document"))?;
                Ok(())
            }
            Locator::Markup {
                field,
                pointer: None,
                occurrence,
                ..
            } => {
                let owner = self.owner();
                let slot = self
                    .field_mut(field)
                    .ok_or_else(|| anyhow!("unknown markup field {field}"))?;
                let text = slot
                    .as_mut()
                    .ok_or_else(|| anyhow!("{field} of {owner} is empty"))?;
                *text = set_markup_alt(text, false, *occurrence, &points_at_expected, alt)
                    .with_context(|| format!("failed to set alt at {locator} of {owner}"))?;
                Ok(())
            }
            other => bail!("{other} has no alt slot"),
        }
    }

    /// Field-per-line rendering used for dry-run diffs.
    pub fn reviewable_text(&self) -> String {
        let mut out = String::new();
        for name in [
            "feature_image",
            "og_image",
            "twitter_image",
            "codeinjection_head",
            "codeinjection_foot",
        ] {
            if let Some(value) = self.field(name) {
                out.push_str(&format!("{name}: {value}\n"));
            }
        }
        if let Some(alt) = &self.feature_image_alt {
            out.push_str(&format!("feature_image_alt: {alt}\n"));
        }
        for (format, text) in self.documents() {
            let pretty = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|value| serde_json::to_string_pretty(&value).ok())
                .unwrap_or_else(|| text.to_string());
            out.push_str(&format!("{}:\n{pretty}\n", format.as_str()));
        }
        if !self.has_document()
            && let Some(html) = &self.html
        {
            out.push_str(&format!("html:\n{html}\n"));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteSettings {
    pub entries: Vec<SettingEntry>,
}

impl SiteSettings {
    pub const ASSET_KEYS: [&'static str; 5] =
        ["logo", "icon", "cover_image", "og_image", "twitter_image"];

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.as_str())
    }

    pub fn references(&self, resolver: &Resolver) -> Vec<ContentReference> {
        let mut out = Vec::new();
        for key in Self::ASSET_KEYS {
            if let Some(raw) = self.value(key) {
                let identifier = resolver.normalize(raw);
                if identifier.is_site_asset() {
                    out.push(ContentReference {
                        owner: Owner::Settings,
                        locator: Locator::Setting {
                            key: key.to_string(),
                        },
                        raw: raw.to_string(),
                        identifier,
                        alt: None,
                    });
                }
            }
        }
        out
    }

    /// Rewrites asset settings pointing at `from`; returns the changed entries.
    pub fn rewrite_asset(
        &mut self,
        resolver: &Resolver,
        from: &Identifier,
        to: &Identifier,
    ) -> Vec<SettingEntry> {
        let mut changed = Vec::new();
        for entry in &mut self.entries {
            if !Self::ASSET_KEYS.contains(&entry.key.as_str()) {
                continue;
            }
            let Some(raw) = entry.value.as_str() else {
                continue;
            };
            if resolver.normalize(raw).base_asset() == *from {
                entry.value = Value::String(resolver.substitute(raw, to.as_str()));
                changed.push(entry.clone());
            }
        }
        changed
    }
}

/// Content URLs found in text that could not be decoded as an item. Used only
/// for reachability.
pub fn scan_unparsed(owner: &Owner, text: &str, resolver: &Resolver) -> Vec<ContentReference> {
    CONTENT_URL
        .find_iter(text)
        .filter_map(|found| {
            let identifier = resolver.normalize(found.as_str());
            identifier.is_site_asset().then(|| ContentReference {
                owner: owner.clone(),
                locator: Locator::Unparsed,
                raw: found.as_str().to_string(),
                identifier,
                alt: None,
            })
        })
        .collect()
}

fn collect_node(value: &Value, pointer: &str, format: DocumentFormat, out: &mut Vec<RawReference>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_pointer = push_pointer(pointer, key);
                match child {
                    Value::String(text) => {
                        collect_string(text, key, Some(map), &child_pointer, format, out)
                    }
                    other => collect_node(other, &child_pointer, format, out),
                }
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let child_pointer = push_pointer(pointer, &index.to_string());
                match child {
                    Value::String(text) => {
                        collect_string(text, "", None, &child_pointer, format, out)
                    }
                    other => collect_node(other, &child_pointer, format, out),
                }
            }
        }
        _ => {}
    }
}

fn collect_string(
    text: &str,
    key: &str,
    parent: Option<&Map<String, Value>>,
    pointer: &str,
    format: DocumentFormat,
    out: &mut Vec<RawReference>,
) {
    let markdown = key == "markdown";
    if markdown || looks_like_markup(text) {
        for (occurrence, span) in markup_spans(text, markdown).into_iter().enumerate() {
            out.push(RawReference {
                locator: Locator::Markup {
                    field: format.as_str().to_string(),
                    pointer: Some(pointer.to_string()),
                    attribute: span.attribute,
                    occurrence,
                },
                raw: text[span.range].to_string(),
                alt: span.alt,
            });
        }
        return;
    }
    let alt = match parent {
        Some(map)
            if key == "src"
                && (map.contains_key("alt")
                    || map.get("type").and_then(Value::as_str) == Some("image")) =>
        {
            Some(
                map.get("alt")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            )
        }
        _ => None,
    };
    out.push(RawReference {
        locator: Locator::Node {
            document: format,
            pointer: pointer.to_string(),
        },
        raw: text.to_string(),
        alt,
    });
}

fn rewrite_node(
    value: &mut Value,
    key: &str,
    rewrite: &mut dyn FnMut(&str) -> Option<String>,
) -> usize {
    match value {
        Value::String(text) => {
            let markdown = key == "markdown";
            if markdown || looks_like_markup(text) {
                let (updated, changed) = rewrite_markup(text, markdown, rewrite);
                if changed > 0 {
                    *text = updated;
                }
                changed
            } else if let Some(replacement) = rewrite(text.as_str()) {
                *text = replacement;
                1
            } else {
                0
            }
        }
        Value::Object(map) => {
            let mut count = 0;
            for (child_key, child) in map.iter_mut() {
                count += rewrite_node(child, child_key, rewrite);
            }
            count
        }
        Value::Array(items) => {
            let mut count = 0;
            for child in items.iter_mut() {
                count += rewrite_node(child, "", rewrite);
            }
            count
        }
        _ => 0,
    }
}

fn push_pointer(pointer: &str, token: &str) -> String {
    format!("{pointer}/{}", token.replace('~', "~0").replace('/', "~1"))
}

fn looks_like_markup(text: &str) -> bool {
    text.contains('<') && text.contains('>')
}

#[derive(Debug, Clone)]
struct MarkupSpan {
    range: Range<usize>,
    attribute: String,
    alt: Option<String>,
    tag: Option<Range<usize>>,
}

impl MarkupSpan {
    fn new(range: Range<usize>, attribute: &str) -> Self {
        Self {
            range,
            attribute: attribute.to_string(),
            alt: None,
            tag: None,
        }
    }
}

fn markup_spans(text: &str, markdown: bool) -> Vec<MarkupSpan> {
    let mut spans = Vec::new();
    for captures in ATTRIBUTE.captures_iter(text) {
        let name = captures[1].to_ascii_lowercase();
        let Some(value) = captures.get(2).or_else(|| captures.get(3)) else {
            continue;
        };
        if name.ends_with("srcset") {
            push_srcset(value.as_str(), value.start(), &name, &mut spans);
        } else {
            spans.push(MarkupSpan::new(value.range(), &name));
        }
    }
    for captures in CSS_URL.captures_iter(text) {
        if let Some(value) = captures
            .get(1)
            .or_else(|| captures.get(2))
            .or_else(|| captures.get(3))
        {
            spans.push(MarkupSpan::new(value.range(), "url()"));
        }
    }
    if markdown {
        for captures in MARKDOWN_LINK.captures_iter(text) {
            if let Some(value) = captures.get(1) {
                spans.push(MarkupSpan::new(value.range(), "markdown"));
            }
        }
    }
    spans.retain(|span| !span.range.is_empty());
    spans.sort_by_key(|span| span.range.start);
    spans.dedup_by_key(|span| span.range.start);

    for tag in IMG_TAG.find_iter(text) {
        let alt = ALT_ATTRIBUTE
            .captures(tag.as_str())
            .and_then(|captures| captures.get(1).or_else(|| captures.get(2)))
            .map(|value| decode_entities(value.as_str()))
            .unwrap_or_default();
        for span in spans.iter_mut().filter(|span| {
            span.attribute == "src" && span.range.start >= tag.start() && span.range.end <= tag.end()
        }) {
            span.alt = Some(alt.clone());
            span.tag = Some(tag.range());
        }
    }
    spans
}

fn push_srcset(value: &str, start: usize, attribute: &str, spans: &mut Vec<MarkupSpan>) {
    let mut offset = start;
    for candidate in value.split(',') {
        let trimmed = candidate.trim_start();
        let leading = candidate.len() - trimmed.len();
        let url_len = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        if url_len > 0 {
            let url_start = offset + leading;
            spans.push(MarkupSpan::new(url_start..url_start + url_len, attribute));
        }
        offset += candidate.len() + 1;
    }
}

fn rewrite_markup(
    text: &str,
    markdown: bool,
    rewrite: &mut dyn FnMut(&str) -> Option<String>,
) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut count = 0;
    for span in markup_spans(text, markdown) {
        if span.range.start < cursor {
            continue;
        }
        if let Some(replacement) = rewrite(&text[span.range.clone()]) {
            out.push_str(&text[cursor..span.range.start]);
            out.push_str(&replacement);
            cursor = span.range.end;
            count += 1;
        }
    }
    out.push_str(&text[cursor..]);
    (out, count)
}

fn set_markup_alt(
    text: &str,
    markdown: bool,
    occurrence: usize,
    points_at_expected: &dyn Fn(&str) -> bool,
    alt: &str,
) -> Result<String> {
    let spans = markup_spans(text, markdown);
    let span = spans
        .get(occurrence)
        .ok_or_else(|| anyhow!("occurrence {occurrence} no longer exists"))?;
    if !points_at_expected(&text[span.range.clone()]) {
        bail!("occurrence {occurrence} points to a different asset");
    }
    let tag = span
        .tag
        .clone()
        .ok_or_else(|| anyhow!("occurrence {occurrence} is not an <img> source"))?;
    let tag_text = &text[tag.clone()];
    let attribute = format!("alt=\"{}\"", escape_attribute(alt));
    let updated_tag = match ALT_ATTRIBUTE.find(tag_text) {
        Some(existing) => format!(
            "{}{attribute}{}",
            &tag_text[..existing.start()],
            &tag_text[existing.end()..]
        ),
        None => format!("<img {attribute}{}", &tag_text["<img".len()..]),
    };
    Ok(format!("{}{updated_tag}{}", &text[..tag.start], &text[tag.end..]))
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
