use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

use crate::filesystem::{AssetListing, MediaLibrary};
use crate::identifier::Identifier;
use crate::index::ContentIndex;
use crate::plan::{ChangeKind, ChangeRecord, Operation, Plan};

/// Suffix Ghost gives the untouched upload next to a resized original.
const ORIGINAL_SUFFIX: &str = "_o";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReachabilityReport {
    pub unreachable: Vec<Identifier>,
    /// Files whose path could not be mapped to an identifier; kept.
    pub unmapped: Vec<PathBuf>,
    pub reachable_files: usize,
    pub unreachable_bytes: u64,
}

/// Files on disk minus everything any item or setting references.
pub fn analyze(index: &ContentIndex, listing: &AssetListing) -> ReachabilityReport {
    let reachable = index.reachable();
    let mut report = ReachabilityReport::default();
    let mut seen = BTreeSet::new();
    for file in &listing.files {
        let Some(identifier) = &file.identifier else {
            report.unmapped.push(file.path.clone());
            continue;
        };
        if is_reachable(identifier, &reachable) {
            report.reachable_files += 1;
        } else if seen.insert(identifier.clone()) {
            report.unreachable_bytes += file.size;
            report.unreachable.push(identifier.clone());
        }
    }
    report
}

fn is_reachable(identifier: &Identifier, reachable: &BTreeSet<Identifier>) -> bool {
    let base = identifier.base_asset();
    if reachable.contains(&base) {
        return true;
    }
    let stem = base.stem();
    match stem.strip_suffix(ORIGINAL_SUFFIX) {
        Some(trimmed) if !trimmed.is_empty() => {
            let name = match base.extension() {
                Some(extension) => format!("{trimmed}.{extension}"),
                None => trimmed.to_string(),
            };
            reachable.contains(&base.with_file_name(&name))
        }
        _ => false,
    }
}

/// Deletion records act on the path an identifier maps to, so a listed file
/// whose name does not map back to itself is reported and kept.
pub fn plan_cleanup(
    index: &ContentIndex,
    listing: &AssetListing,
    library: &MediaLibrary,
) -> (Plan, ReachabilityReport) {
    let report = analyze(index, listing);
    let mut plan = Plan::new(Operation::Cleanup);
    for path in &report.unmapped {
        plan.warn(format!(
            "{} could not be mapped to an identifier; keeping it",
            path.display()
        ));
    }
    let unreachable: BTreeSet<&Identifier> = report.unreachable.iter().collect();
    let mut planned = BTreeSet::new();
    for file in &listing.files {
        let Some(identifier) = &file.identifier else {
            continue;
        };
        if !unreachable.contains(identifier) {
            continue;
        }
        if library.path_for(identifier).as_deref() != Some(file.path.as_path()) {
            plan.skip(
                identifier.as_str(),
                format!(
                    "file name {} does not match its identifier; keeping it",
                    file.path.display()
                ),
            );
            continue;
        }
        if planned.insert(identifier.clone()) {
            plan.push_record(ChangeRecord::new(
                ChangeKind::Deletion,
                identifier.clone(),
                identifier.to_string(),
                String::new(),
            ));
        }
    }
    (plan, report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::filesystem::AssetFile;
    use crate::index::build_index;
    use crate::test_support::{MemoryContentApi, SiteFixture};

    fn unreachable(report: &ReachabilityReport) -> Vec<&str> {
        report
            .unreachable
            .iter()
            .map(Identifier::as_str)
            .collect()
    }

    #[test]
    fn only_unreferenced_files_are_unreachable() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/a.jpg", b"a");
        fixture.write("/content/images/b.png", b"b");
        fixture.write("/content/images/logo.png", b"l");
        fixture.write("/content/images/orphan.jpg", b"orphan");
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "p1",
            "slug": "published",
            "status": "published",
            "html": "<img src=\"/content/images/a.jpg\">",
        }));
        api.add_post(json!({
            "id": "p2",
            "slug": "draft",
            "status": "draft",
            "feature_image": "https://blog.example.com/content/images/b.png?v=2",
        }));
        api.set_setting("logo", json!("__GHOST_URL__/content/images/logo.png"));
        let index = build_index(&mut api, &fixture.resolver, 50).expect("index");
        let listing = fixture
            .library
            .list_assets(&fixture.resolver)
            .expect("listing");

        let (plan, report) = plan_cleanup(&index, &listing, &fixture.library);
        assert_eq!(unreachable(&report), vec!["/content/images/orphan.jpg"]);
        assert_eq!(report.reachable_files, 3);
        assert_eq!(report.unreachable_bytes, 6);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].kind, ChangeKind::Deletion);
        assert!(plan.records[0].new_value.is_empty());
    }

    #[test]
    fn renditions_and_original_uploads_follow_their_base() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/2024/photo.jpg", b"p");
        fixture.write("/content/images/2024/photo_o.jpg", b"o");
        fixture.write("/content/images/size/w600/2024/photo.jpg", b"s");
        fixture.write("/content/images/format/webp/2024/photo.jpg", b"f");
        fixture.write("/content/images/size/w600/2024/gone.jpg", b"g");
        let mut api = MemoryContentApi::new();
        api.add_page(json!({"id": "g", "slug": "page", "feature_image": "/content/images/2024/photo.jpg"}));
        let index = build_index(&mut api, &fixture.resolver, 50).expect("index");
        let listing = fixture
            .library
            .list_assets(&fixture.resolver)
            .expect("listing");

        let report = analyze(&index, &listing);
        assert_eq!(
            unreachable(&report),
            vec!["/content/images/size/w600/2024/gone.jpg"]
        );
    }

    #[test]
    fn unparsed_items_and_unmapped_files_stay_reachable() {
        let fixture = SiteFixture::new();
        let mut api = MemoryContentApi::new();
        api.add_post(json!({"id": 1, "html": "<img src=\"/content/images/kept.jpg\">"}));
        let index = build_index(&mut api, &fixture.resolver, 50).expect("index");
        let listing = AssetListing {
            files: vec![
                AssetFile {
                    path: fixture.path("/content/images/kept.jpg"),
                    size: 1,
                    modified: None,
                    identifier: Some(Identifier::new("/content/images/kept.jpg")),
                },
                AssetFile {
                    path: fixture.root().join("content/images/\u{fffd}.jpg"),
                    size: 1,
                    modified: None,
                    identifier: None,
                },
            ],
        };
        let (plan, report) = plan_cleanup(&index, &listing, &fixture.library);
        assert!(report.unreachable.is_empty());
        assert_eq!(report.unmapped.len(), 1);
        assert!(plan.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn literal_percent_file_name_matches_its_encoded_reference() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/a%20b.jpg", b"kept");
        fixture.write("/content/images/a b.jpg", b"orphan");
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "p1",
            "slug": "encoded",
            "html": "<img src=\"/content/images/a%2520b.jpg\">",
        }));
        let index = build_index(&mut api, &fixture.resolver, 50).expect("index");
        let listing = fixture
            .library
            .list_assets(&fixture.resolver)
            .expect("listing");

        let (plan, report) = plan_cleanup(&index, &listing, &fixture.library);
        assert_eq!(unreachable(&report), vec!["/content/images/a b.jpg"]);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].subject.as_str(), "/content/images/a b.jpg");
    }

    #[test]
    fn cleanup_keeps_files_whose_name_does_not_map_back() {
        let fixture = SiteFixture::new();
        let mut api = MemoryContentApi::new();
        let index = build_index(&mut api, &fixture.resolver, 50).expect("index");
        let orphan = Identifier::new("/content/images/orphan.jpg");
        let listing = AssetListing {
            files: vec![
                AssetFile {
                    path: fixture.path("/content/images/orphan.jpg"),
                    size: 1,
                    modified: None,
                    identifier: Some(orphan.clone()),
                },
                AssetFile {
                    path: fixture.root().join("content/images/orphan-alias.jpg"),
                    size: 1,
                    modified: None,
                    identifier: Some(orphan.clone()),
                },
                AssetFile {
                    path: fixture.root().join("content/images/elsewhere.jpg"),
                    size: 1,
                    modified: None,
                    identifier: Some(Identifier::new("/content/images/lonely.jpg")),
                },
            ],
        };

        let (plan, report) = plan_cleanup(&index, &listing, &fixture.library);
        assert_eq!(report.unreachable.len(), 2);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].subject, orphan);
        let skipped: Vec<&str> = plan
            .skipped
            .iter()
            .map(|skip| skip.subject.as_str())
            .collect();
        assert_eq!(
            skipped,
            vec!["/content/images/orphan.jpg", "/content/images/lonely.jpg"]
        );
        assert!(plan.skipped[0].reason.contains("orphan-alias.jpg"));
    }
}
