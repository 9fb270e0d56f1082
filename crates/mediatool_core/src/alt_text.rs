use std::sync::LazyLock;

use regex::Regex;

use crate::content::Owner;
use crate::identifier::IMAGES_PREFIX;
use crate::index::ContentIndex;
use crate::plan::{ChangeKind, ChangeRecord, Operation, Plan};

static GENERATED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:-\d+x\d+|@\d+x|-scaled|_o|-e\d{6,})$").expect("valid regex")
});
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:%20|[-_.+\s])+").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct AltTextOptions {
    /// Replace alt text that is already set.
    pub force: bool,
}

/// Readable alt text from an upload's file name, e.g.
/// `golden-gate_bridge-1024x768@2x.jpg` becomes `golden gate bridge`.
pub fn derive_alt_text(file_name: &str) -> String {
    let stem = match file_name.rfind('.') {
        Some(index) if index > 0 => &file_name[..index],
        _ => file_name,
    };
    let mut stem = stem.to_string();
    while let Some(found) = GENERATED_SUFFIX.find(&stem) {
        if found.start() == 0 {
            break;
        }
        stem.truncate(found.start());
    }
    SEPARATORS.replace_all(&stem, " ").trim().to_string()
}

pub fn plan_alt_text(index: &ContentIndex, options: AltTextOptions) -> Plan {
    let mut plan = Plan::new(Operation::AltText);
    for reference in &index.references {
        if !matches!(reference.owner, Owner::Item { .. }) || !reference.is_rewritable() {
            continue;
        }
        let Some(current) = &reference.alt else {
            continue;
        };
        let base = reference.base();
        if !base.as_str().starts_with(IMAGES_PREFIX) {
            continue;
        }
        let subject = format!("{} {}", reference.owner, reference.locator);
        let derived = derive_alt_text(base.file_name());
        let current = current.trim();
        if derived.is_empty() {
            plan.skip(subject, format!("no alt text can be derived from {base}"));
            continue;
        }
        if !current.is_empty() && !options.force {
            plan.skip(subject, "alt text already set");
            continue;
        }
        if current == derived {
            plan.skip(subject, "alt text already matches the file name");
            continue;
        }
        plan.push_record(
            ChangeRecord::new(ChangeKind::AltText, base, current.to_string(), derived)
                .with_references(vec![reference.clone()]),
        );
    }
    plan
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::index::build_index;
    use crate::test_support::{MemoryContentApi, SiteFixture};

    #[test]
    fn derives_text_from_generated_file_names() {
        assert_eq!(derive_alt_text("sunset-beach.jpg"), "sunset beach");
        assert_eq!(
            derive_alt_text("golden-gate_bridge-1024x768@2x.jpg"),
            "golden gate bridge"
        );
        assert_eq!(derive_alt_text("IMG_2041-scaled.jpeg"), "IMG 2041");
        assert_eq!(derive_alt_text("portrait_o.png"), "portrait");
        assert_eq!(derive_alt_text("photo-e1612345678901.jpg"), "photo");
        assert_eq!(derive_alt_text("cats%20and+dogs.v2.webp"), "cats and dogs v2");
        assert_eq!(derive_alt_text("---.png"), "");
    }

    fn index_with(alt: &str) -> ContentIndex {
        let fixture = SiteFixture::new();
        let mut api = MemoryContentApi::new();
        api.add_post(json!({
            "id": "p1",
            "slug": "holiday",
            "feature_image": "/content/images/2024/sunset-beach.jpg",
            "feature_image_alt": alt,
            "html": "<img src=\"/content/images/size/w600/2024/dunes.jpg\" alt=\"\"><a href=\"/content/files/guide.pdf\">guide</a>",
        }));
        api.set_setting("logo", json!("/content/images/logo.png"));
        build_index(&mut api, &fixture.resolver, 50).expect("index")
    }

    #[test]
    fn existing_alt_is_kept_unless_forced() {
        let index = index_with("Sunset");

        let plan = plan_alt_text(&index, AltTextOptions { force: false });
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].subject.as_str(), "/content/images/2024/dunes.jpg");
        assert_eq!(plan.records[0].new_value, "dunes");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].reason, "alt text already set");

        let forced = plan_alt_text(&index, AltTextOptions { force: true });
        assert_eq!(forced.records.len(), 2);
        assert_eq!(forced.records[0].old_value, "Sunset");
        assert_eq!(forced.records[0].new_value, "sunset beach");
    }

    #[test]
    fn matching_alt_is_skipped_even_when_forced() {
        let index = index_with("sunset beach");
        let plan = plan_alt_text(&index, AltTextOptions { force: true });
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.skipped[0].reason, "alt text already matches the file name");
    }
}
