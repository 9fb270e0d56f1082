use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::ContentApi;
use crate::content::{
    ContentItem, ContentReference, ItemKind, Locator, Owner, SiteSettings, scan_unparsed,
};
use crate::filesystem::AssetListing;
use crate::identifier::{Identifier, Resolver};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedItem {
    pub kind: ItemKind,
    pub id: Option<String>,
    pub reason: String,
}

/// Every asset reference across posts, pages and site settings, rebuilt per run.
#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    pub items: Vec<ContentItem>,
    pub settings: SiteSettings,
    pub references: Vec<ContentReference>,
    pub skipped: Vec<SkippedItem>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DanglingReference {
    pub owner: String,
    pub locator: String,
    pub raw: String,
    pub identifier: Identifier,
}

impl ContentIndex {
    /// References grouped by base asset, each group in discovery order.
    pub fn references_by_base(&self) -> BTreeMap<Identifier, Vec<&ContentReference>> {
        let mut grouped: BTreeMap<Identifier, Vec<&ContentReference>> = BTreeMap::new();
        for reference in &self.references {
            grouped.entry(reference.base()).or_default().push(reference);
        }
        grouped
    }

    /// Base assets referenced anywhere, drafts and unparsed items included.
    pub fn reachable(&self) -> BTreeSet<Identifier> {
        self.references
            .iter()
            .map(ContentReference::base)
            .collect()
    }

    pub fn item(&self, kind: ItemKind, id: &str) -> Option<&ContentItem> {
        self.items
            .iter()
            .find(|item| item.kind == kind && item.id == id)
    }

    pub fn counts_by_field(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for reference in &self.references {
            *counts.entry(field_label(&reference.locator)).or_insert(0) += 1;
        }
        counts
    }

    pub fn counts_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.kind.collection()).or_insert(0) += 1;
        }
        counts
    }
}

fn field_label(locator: &Locator) -> String {
    match locator {
        Locator::Field { name } => name.clone(),
        Locator::Node { document, .. } => document.as_str().to_string(),
        Locator::Markup { field, .. } => field.clone(),
        Locator::Setting { .. } => "settings".to_string(),
        Locator::Unparsed => "unparsed".to_string(),
    }
}

pub fn build_index<A: ContentApi + ?Sized>(
    api: &mut A,
    resolver: &Resolver,
    page_size: u32,
) -> Result<ContentIndex> {
    let mut index = ContentIndex::default();

    for kind in ItemKind::ALL {
        let mut page = 1;
        loop {
            let listing = api
                .list_items(kind, page, page_size)
                .with_context(|| format!("failed to list {} page {page}", kind.collection()))?;
            debug!(
                collection = kind.collection(),
                page,
                items = listing.items.len(),
                "fetched content page"
            );
            for value in listing.items {
                index_item(&mut index, kind, value, resolver);
            }
            match listing.next_page {
                Some(next) if next > page => page = next,
                Some(next) => bail!(
                    "content API returned non-advancing page {next} after page {page} of {}",
                    kind.collection()
                ),
                None => break,
            }
        }
    }

    index.settings = api
        .fetch_settings()
        .context("failed to fetch site settings")?;
    let settings_references = index.settings.references(resolver);
    index.references.extend(settings_references);
    index.request_count = api.request_count();

    info!(
        items = index.items.len(),
        references = index.references.len(),
        skipped = index.skipped.len(),
        "built content index"
    );
    Ok(index)
}

fn index_item(index: &mut ContentIndex, kind: ItemKind, value: serde_json::Value, resolver: &Resolver) {
    let id = value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);
    let raw_text = value.to_string();

    let parsed = ContentItem::from_value(kind, value)
        .and_then(|item| item.references(resolver).map(|references| (item, references)));
    match parsed {
        Ok((item, references)) => {
            index.references.extend(references);
            index.items.push(item);
        }
        Err(error) => {
            let reason = format!("{error:#}");
            warn!(
                collection = kind.collection(),
                id = id.as_deref().unwrap_or("?"),
                %reason,
                "content item could not be parsed; scanning raw text"
            );
            let owner = Owner::Item {
                kind,
                id: id.clone().unwrap_or_default(),
                slug: String::new(),
                status: None,
            };
            index
                .references
                .extend(scan_unparsed(&owner, &raw_text, resolver));
            index.skipped.push(SkippedItem { kind, id, reason });
        }
    }
}

/// References into the media roots whose base asset has no file on disk.
pub fn find_dangling(index: &ContentIndex, listing: &AssetListing) -> Vec<DanglingReference> {
    let on_disk: BTreeSet<Identifier> = listing
        .files
        .iter()
        .filter_map(|file| file.identifier.as_ref())
        .map(Identifier::base_asset)
        .collect();
    index
        .references
        .iter()
        .filter(|reference| !on_disk.contains(&reference.base()))
        .map(|reference| DanglingReference {
            owner: reference.owner.to_string(),
            locator: reference.locator.to_string(),
            raw: reference.raw.clone(),
            identifier: reference.identifier.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::ApiError;
    use crate::filesystem::AssetFile;
    use crate::test_support::MemoryContentApi;

    fn resolver() -> Resolver {
        Resolver::new("https://blog.example.com").expect("resolver")
    }

    #[test]
    fn follows_pagination_across_posts_and_pages() {
        let mut api = MemoryContentApi::new();
        for n in 0..5 {
            api.add_post(json!({
                "id": format!("p{n}"),
                "slug": format!("post-{n}"),
                "feature_image": format!("/content/images/p{n}.jpg"),
            }));
        }
        api.add_page(json!({"id": "g1", "slug": "about", "html": "<img src=\"/content/images/me.jpg\">"}));
        api.set_setting("logo", json!("__GHOST_URL__/content/images/logo.png"));

        let index = build_index(&mut api, &resolver(), 2).expect("index");
        assert_eq!(index.items.len(), 6);
        assert_eq!(index.references.len(), 7);
        assert_eq!(index.counts_by_kind().get("posts"), Some(&5));
        assert_eq!(index.counts_by_field().get("settings"), Some(&1));
        assert_eq!(api.list_calls(), 4);
        assert!(
            index
                .reachable()
                .contains(&Identifier::new("/content/images/logo.png"))
        );
    }

    #[test]
    fn unparseable_item_is_skipped_but_still_scanned() {
        let mut api = MemoryContentApi::new();
        api.add_post(json!({"id": 42, "slug": "broken", "html": "<img src=\"/content/images/kept.jpg\">"}));
        api.add_post(json!({"id": "ok", "slug": "fine", "lexical": "{not json", "feature_image": "/content/images/f.jpg"}));

        let index = build_index(&mut api, &resolver(), 10).expect("index");
        assert!(index.items.is_empty());
        assert_eq!(index.skipped.len(), 2);
        assert_eq!(index.skipped[1].id.as_deref(), Some("ok"));
        let reachable = index.reachable();
        assert!(reachable.contains(&Identifier::new("/content/images/kept.jpg")));
        assert!(reachable.contains(&Identifier::new("/content/images/f.jpg")));
        assert!(index.references.iter().all(|reference| !reference.is_rewritable()));
    }

    #[test]
    fn unreachable_api_is_fatal() {
        let mut api = MemoryContentApi::new();
        api.fail_listing(ApiError::Unreachable("connection refused".to_string()));
        let error = build_index(&mut api, &resolver(), 10).expect_err("must fail");
        assert!(format!("{error:#}").contains("connection refused"));
    }

    #[test]
    fn dangling_references_compare_base_assets() {
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "p1",
            "slug": "p",
            "html": "<img src=\"/content/images/size/w600/here.jpg\"><img src=\"/content/images/gone.jpg\">",
        }));
        let index = build_index(&mut api, &resolver(), 10).expect("index");
        let listing = AssetListing {
            files: vec![AssetFile {
                path: "/srv/ghost/content/images/here.jpg".into(),
                size: 1,
                modified: None,
                identifier: Some(Identifier::new("/content/images/here.jpg")),
            }],
        };
        let dangling = find_dangling(&index, &listing);
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].identifier.as_str(), "/content/images/gone.jpg");
        assert_eq!(dangling[0].locator, "html src#1");
    }
}
