use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::content::ContentReference;
use crate::filesystem::{AssetListing, MediaLibrary};
use crate::identifier::{IMAGES_PREFIX, Identifier};
use crate::index::ContentIndex;
use crate::plan::{ChangeKind, ChangeRecord, Operation, Plan};

/// Source extensions the converter accepts. GIF is left alone since it may be animated.
pub const CONVERTIBLE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

pub trait ImageCodec {
    fn target_extension(&self) -> &'static str;
    fn encode(&self, source: &[u8], quality: u8) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebpCodec;

impl ImageCodec for WebpCodec {
    fn target_extension(&self) -> &'static str {
        "webp"
    }

    fn encode(&self, source: &[u8], quality: u8) -> Result<Vec<u8>> {
        let image = image::load_from_memory(source).context("failed to decode source image")?;
        let encoder = webp::Encoder::from_image(&image)
            .map_err(|reason| anyhow!("failed to prepare WebP encoder: {reason}"))?;
        Ok(encoder.encode(f32::from(quality)).to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Overwrite an existing `<stem>.webp` instead of picking `<stem>_<ext>.webp`.
    pub force: bool,
}

pub fn is_convertible(identifier: &Identifier) -> bool {
    identifier.as_str().starts_with(IMAGES_PREFIX)
        && !identifier.is_rendition()
        && identifier
            .extension()
            .map(|extension| CONVERTIBLE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

pub fn plan_conversion(
    index: &ContentIndex,
    listing: &AssetListing,
    library: &MediaLibrary,
    target_extension: &str,
    options: ConvertOptions,
) -> Plan {
    let mut plan = Plan::new(Operation::Convert);
    let existing: BTreeSet<&Identifier> = listing
        .files
        .iter()
        .filter_map(|file| file.identifier.as_ref())
        .collect();
    let by_base = index.references_by_base();
    let mut seen = BTreeSet::new();
    let mut claimed: BTreeSet<Identifier> = BTreeSet::new();

    for file in &listing.files {
        let Some(identifier) = &file.identifier else {
            continue;
        };
        if !is_convertible(identifier) {
            continue;
        }
        if !seen.insert(identifier.clone()) {
            plan.warn(format!(
                "{} resolves to {identifier}, which is already planned; skipping duplicate",
                file.path.display()
            ));
            continue;
        }
        if library.path_for(identifier).as_deref() != Some(file.path.as_path()) {
            plan.skip(
                identifier.as_str(),
                format!(
                    "file name {} does not match its identifier",
                    file.path.display()
                ),
            );
            continue;
        }

        let references = owned_references(&by_base, identifier);
        if references.iter().any(|reference| !reference.is_rewritable()) {
            plan.skip(
                identifier.as_str(),
                "referenced from a content item that could not be parsed",
            );
            continue;
        }

        let Some(target) = choose_target(
            identifier,
            target_extension,
            &existing,
            &claimed,
            options.force,
            &mut plan,
        ) else {
            continue;
        };
        debug!(source = %identifier, target = %target, references = references.len(), "planned conversion");
        claimed.insert(target.clone());
        plan.push_record(
            ChangeRecord::new(
                ChangeKind::CodecConversion,
                identifier.clone(),
                identifier.to_string(),
                target.to_string(),
            )
            .with_references(references),
        );
    }
    plan
}

fn choose_target(
    source: &Identifier,
    target_extension: &str,
    existing: &BTreeSet<&Identifier>,
    claimed: &BTreeSet<Identifier>,
    force: bool,
    plan: &mut Plan,
) -> Option<Identifier> {
    let stem = source.stem();
    let primary = source.with_file_name(&format!("{stem}.{target_extension}"));
    let on_disk = existing.contains(&primary);
    if !claimed.contains(&primary) && (!on_disk || force) {
        if on_disk {
            plan.warn(format!("{primary} exists and will be overwritten (--force)"));
        }
        return Some(primary);
    }

    let source_extension = source.extension().unwrap_or_default().to_ascii_lowercase();
    let fallback =
        source.with_file_name(&format!("{stem}_{source_extension}.{target_extension}"));
    if claimed.contains(&fallback) || existing.contains(&fallback) {
        plan.skip(
            source.as_str(),
            format!("both {primary} and {fallback} are taken"),
        );
        return None;
    }
    plan.warn(format!(
        "{primary} is taken; converting {source} to {fallback}"
    ));
    Some(fallback)
}

fn owned_references(
    by_base: &BTreeMap<Identifier, Vec<&ContentReference>>,
    identifier: &Identifier,
) -> Vec<ContentReference> {
    by_base
        .get(identifier)
        .map(|references| references.iter().map(|reference| (*reference).clone()).collect())
        .unwrap_or_default()
}
