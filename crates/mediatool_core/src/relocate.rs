use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::content::{ContentReference, Owner};
use crate::filesystem::{AssetListing, MediaLibrary};
use crate::identifier::Identifier;
use crate::index::ContentIndex;
use crate::plan::{ChangeKind, ChangeRecord, Operation, Plan};

/// Directory under each content root that holds assets used by several items.
pub const SHARED_DIRNAME: &str = "shared";

enum Ownership<'a> {
    Single(&'a Owner),
    Shared(Vec<&'a str>),
    SettingsOnly,
    Unparsed,
    Unowned,
}

fn ownership<'a>(references: &[&'a ContentReference]) -> Ownership<'a> {
    if references.iter().any(|reference| !reference.is_rewritable()) {
        return Ownership::Unparsed;
    }
    let owners: BTreeSet<&Owner> = references
        .iter()
        .map(|reference| &reference.owner)
        .filter(|owner| matches!(owner, Owner::Item { .. }))
        .collect();
    match owners.len() {
        0 if references.is_empty() => Ownership::Unowned,
        0 => Ownership::SettingsOnly,
        1 => owners
            .into_iter()
            .next()
            .map(Ownership::Single)
            .unwrap_or(Ownership::Unowned),
        _ => Ownership::Shared(owners.into_iter().filter_map(Owner::slug).collect()),
    }
}

/// Plans moving each asset into a directory named after the one item using it.
///
/// Items are visited in slug order and their references in discovery order;
/// the nth asset of an item becomes `<root>/<slug>/<slug>-<n><ext>`. Assets
/// used by several items go to `<root>/shared/` keeping their relative path.
pub fn plan_relocation(index: &ContentIndex, listing: &AssetListing, library: &MediaLibrary) -> Plan {
    let mut plan = Plan::new(Operation::Relocate);
    let by_base = index.references_by_base();
    let occupied: BTreeSet<&Identifier> = listing
        .files
        .iter()
        .filter_map(|file| file.identifier.as_ref())
        .collect();

    let mut candidates: Vec<&Identifier> = Vec::new();
    let mut seen = BTreeSet::new();
    for file in &listing.files {
        let Some(identifier) = &file.identifier else {
            continue;
        };
        if identifier.is_rendition() || identifier.content_prefix().is_none() {
            continue;
        }
        if !seen.insert(identifier) {
            plan.warn(format!(
                "{} resolves to {identifier}, which is already considered; skipping duplicate",
                file.path.display()
            ));
            continue;
        }
        if library.path_for(identifier).as_deref() != Some(file.path.as_path()) {
            plan.skip(
                identifier.as_str(),
                format!("file name {} does not match its identifier", file.path.display()),
            );
            continue;
        }
        candidates.push(identifier);
    }
    let candidate_set: BTreeSet<&Identifier> = candidates.iter().copied().collect();

    let empty = Vec::new();
    let references_of = |identifier: &Identifier| by_base.get(identifier).unwrap_or(&empty);

    let mut items: Vec<_> = index.items.iter().collect();
    items.sort_by(|left, right| left.slug.cmp(&right.slug).then(left.id.cmp(&right.id)));
    let mut by_owner: BTreeMap<&Owner, Vec<&ContentReference>> = BTreeMap::new();
    for reference in &index.references {
        by_owner.entry(&reference.owner).or_default().push(reference);
    }

    let mut claimed: BTreeSet<Identifier> = BTreeSet::new();
    let mut decided: BTreeSet<&Identifier> = BTreeSet::new();
    let mut counters: BTreeMap<&str, u32> = BTreeMap::new();

    for item in items {
        let owner = item.owner();
        let Some(owned) = by_owner.get(&owner) else {
            continue;
        };
        for reference in owned {
            let base = reference.base();
            let Some(identifier) = candidate_set.get(&base).copied() else {
                continue;
            };
            if decided.contains(identifier) {
                continue;
            }
            let references = references_of(identifier);
            let Ownership::Single(single) = ownership(references) else {
                continue;
            };
            if *single != owner {
                continue;
            }
            decided.insert(identifier);

            let slug = item.slug.as_str();
            if !is_directory_safe(slug) {
                plan.skip(
                    identifier.as_str(),
                    format!("owner {owner} has no usable slug"),
                );
                continue;
            }
            let counter = counters.entry(slug).or_insert(0);
            *counter += 1;
            if identifier.parent() == slug_directory(identifier, slug) {
                debug!(asset = %identifier, slug, "asset already in its slug directory");
                continue;
            }
            let mut target = slug_target(identifier, slug, *counter);
            while occupied.contains(&target) || claimed.contains(&target) {
                *counter += 1;
                target = slug_target(identifier, slug, *counter);
            }
            claimed.insert(target.clone());
            plan.push_record(
                ChangeRecord::new(
                    ChangeKind::Relocation,
                    identifier.clone(),
                    identifier.to_string(),
                    target.to_string(),
                )
                .with_references(references.iter().map(|reference| (*reference).clone()).collect()),
            );
        }
    }

    for identifier in candidates {
        if decided.contains(identifier) {
            continue;
        }
        let references = references_of(identifier);
        match ownership(references) {
            Ownership::Single(_) => {}
            Ownership::Unowned => plan.unowned.push(identifier.clone()),
            Ownership::SettingsOnly => {
                plan.skip(identifier.as_str(), "referenced only by site settings")
            }
            Ownership::Unparsed => plan.skip(
                identifier.as_str(),
                "referenced from a content item that could not be parsed",
            ),
            Ownership::Shared(slugs) => {
                let Some(target) = shared_target(identifier) else {
                    continue;
                };
                if occupied.contains(&target) || claimed.contains(&target) {
                    plan.skip(identifier.as_str(), format!("shared target {target} is taken"));
                    continue;
                }
                plan.warn(format!(
                    "{identifier} is used by {} items ({}); moving to {target}",
                    slugs.len(),
                    slugs.join(", ")
                ));
                claimed.insert(target.clone());
                plan.push_record(
                    ChangeRecord::new(
                        ChangeKind::Relocation,
                        identifier.clone(),
                        identifier.to_string(),
                        target.to_string(),
                    )
                    .with_references(
                        references.iter().map(|reference| (*reference).clone()).collect(),
                    ),
                );
            }
        }
    }
    plan
}

fn is_directory_safe(slug: &str) -> bool {
    !slug.is_empty() && slug != "." && slug != ".." && !slug.contains(['/', '\\'])
}

fn slug_directory(identifier: &Identifier, slug: &str) -> String {
    format!("{}{slug}/", identifier.content_prefix().unwrap_or_default())
}

fn slug_target(identifier: &Identifier, slug: &str, n: u32) -> Identifier {
    let extension = identifier
        .extension()
        .map(|extension| format!(".{extension}"))
        .unwrap_or_default();
    Identifier::new(format!("{}{slug}-{n}{extension}", slug_directory(identifier, slug)))
}

/// `None` when the asset already lives in the shared directory.
fn shared_target(identifier: &Identifier) -> Option<Identifier> {
    let prefix = identifier.content_prefix()?;
    let relative = identifier.relative_path()?;
    if relative.starts_with(&format!("{SHARED_DIRNAME}/")) {
        return None;
    }
    Some(Identifier::new(format!("{prefix}{SHARED_DIRNAME}/{relative}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::index::build_index;
    use crate::test_support::{MemoryContentApi, SiteFixture};

    fn plan_for(fixture: &SiteFixture, api: &mut MemoryContentApi) -> Plan {
        let index = build_index(api, &fixture.resolver, 50).expect("index");
        let listing = fixture
            .library
            .list_assets(&fixture.resolver)
            .expect("listing");
        plan_relocation(&index, &listing, &fixture.library)
    }

    fn moves(plan: &Plan) -> Vec<(String, String)> {
        plan.records
            .iter()
            .map(|record| (record.old_value.clone(), record.new_value.clone()))
            .collect()
    }

    #[test]
    fn single_owner_assets_move_into_numbered_slug_paths() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/2024/01/hero.jpg", b"1");
        fixture.write("/content/images/2024/01/inline.png", b"2");
        fixture.write("/content/images/2023/about.jpg", b"3");
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "p1",
            "slug": "zebra-facts",
            "feature_image": "/content/images/2024/01/hero.jpg",
            "html": "<img src=\"/content/images/size/w600/2024/01/inline.png\"><img src=\"/content/images/2024/01/hero.jpg\">",
        }));
        api.add_page(json!({
            "id": "g1",
            "slug": "about",
            "html": "<img src=\"__GHOST_URL__/content/images/2023/about.jpg\">",
        }));

        let plan = plan_for(&fixture, &mut api);
        assert_eq!(
            moves(&plan),
            vec![
                (
                    "/content/images/2023/about.jpg".to_string(),
                    "/content/images/about/about-1.jpg".to_string()
                ),
                (
                    "/content/images/2024/01/hero.jpg".to_string(),
                    "/content/images/zebra-facts/zebra-facts-1.jpg".to_string()
                ),
                (
                    "/content/images/2024/01/inline.png".to_string(),
                    "/content/images/zebra-facts/zebra-facts-2.png".to_string()
                ),
            ]
        );
        assert_eq!(plan.records[1].references.len(), 2);
        assert!(plan.unowned.is_empty());
    }

    #[test]
    fn shared_unowned_settings_only_and_in_place_assets() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/common.jpg", b"c");
        fixture.write("/content/images/orphan.jpg", b"o");
        fixture.write("/content/images/logo.png", b"l");
        fixture.write("/content/images/solo/solo-1.jpg", b"s");
        fixture.write("/content/images/new.jpg", b"n");
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "a",
            "slug": "alpha",
            "feature_image": "/content/images/common.jpg",
        }));
        api.add_post(json!({
            "id": "b",
            "slug": "beta",
            "og_image": "/content/images/common.jpg",
        }));
        api.add_post(json!({
            "id": "s",
            "slug": "solo",
            "html": "<img src=\"/content/images/solo/solo-1.jpg\"><img src=\"/content/images/new.jpg\">",
        }));
        api.set_setting("logo", json!("/content/images/logo.png"));

        let plan = plan_for(&fixture, &mut api);
        assert_eq!(
            moves(&plan),
            vec![
                (
                    "/content/images/new.jpg".to_string(),
                    "/content/images/solo/solo-2.jpg".to_string()
                ),
                (
                    "/content/images/common.jpg".to_string(),
                    "/content/images/shared/common.jpg".to_string()
                ),
            ]
        );
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("alpha, beta"));
        assert_eq!(plan.unowned, vec![Identifier::new("/content/images/orphan.jpg")]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].reason, "referenced only by site settings");
    }

    #[test]
    fn occupied_targets_bump_the_counter() {
        let fixture = SiteFixture::new();
        fixture.write("/content/images/first.jpg", b"1");
        fixture.write("/content/images/post/post-1.jpg", b"unrelated");
        let mut api = MemoryContentApi::new();
        api.add_post(json!({"id": "p", "slug": "post", "feature_image": "/content/images/first.jpg"}));

        let plan = plan_for(&fixture, &mut api);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].new_value, "/content/images/post/post-2.jpg");
        assert_eq!(plan.unowned, vec![Identifier::new("/content/images/post/post-1.jpg")]);
    }
}
