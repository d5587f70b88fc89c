use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::schema::{CustomMode, EnhancementEffect};

/// Effect id prefix shared by every catalog entry.
pub const EFFECT_NAMESPACE: &str = "anime4k";

const CATALOG_ENTRIES: &[(&str, &str, &str, Option<u32>)] = &[
    ("Deblur/DoG", "Deblur (DoG)", "DoG", None),
    (
        "Denoise/BilateralMean",
        "Denoise (Bilateral Mean)",
        "BilateralMean",
        None,
    ),
    ("Restore/CNNM", "Restore CNN (M)", "CNNM", None),
    ("Restore/CNNSoftM", "Restore CNN Soft (M)", "CNNSoftM", None),
    ("Restore/CNNSoftVL", "Restore CNN Soft (VL)", "CNNSoftVL", None),
    ("Restore/CNNVL", "Restore CNN (VL)", "CNNVL", None),
    ("Restore/CNNUL", "Restore CNN (UL)", "CNNUL", None),
    ("Restore/GANUUL", "Restore GAN (UUL)", "GANUUL", None),
    ("Upscale/CNNx2M", "Upscale CNN x2 (M)", "CNNx2M", Some(2)),
    ("Upscale/CNNx2VL", "Upscale CNN x2 (VL)", "CNNx2VL", Some(2)),
    (
        "Upscale/DenoiseCNNx2VL",
        "Upscale & Denoise CNN x2 (VL)",
        "DenoiseCNNx2VL",
        Some(2),
    ),
    ("Upscale/CNNx2UL", "Upscale CNN x2 (UL)", "CNNx2UL", Some(2)),
    ("Upscale/GANx3L", "Upscale GAN x3 (L)", "GANx3L", Some(3)),
    ("Upscale/GANx4UUL", "Upscale GAN x4 (UUL)", "GANx4UUL", Some(4)),
    (
        "Helper/ClampHighlights",
        "Helper: Clamp Highlights",
        "ClampHighlights",
        None,
    ),
];

struct Catalog {
    effects: Vec<EnhancementEffect>,
    by_id: HashMap<String, usize>,
}

fn catalog_index() -> &'static Catalog {
    static CATALOG: OnceLock<Catalog> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let effects = CATALOG_ENTRIES
            .iter()
            .map(|(path, name, algorithm, factor)| EnhancementEffect {
                id: format!("{EFFECT_NAMESPACE}/{path}"),
                name: (*name).to_owned(),
                algorithm: (*algorithm).to_owned(),
                upscale_factor: *factor,
                params: BTreeMap::new(),
            })
            .collect::<Vec<_>>();
        let by_id = effects
            .iter()
            .enumerate()
            .map(|(index, effect)| (effect.id.clone(), index))
            .collect();
        Catalog { effects, by_id }
    })
}

/// Every effect a user can put in a chain. Intermediate downscaling is not listed
/// here; the pipeline builder inserts it on its own.
pub fn catalog() -> &'static [EnhancementEffect] {
    &catalog_index().effects
}

pub fn find_by_id(id: &str) -> Option<&'static EnhancementEffect> {
    let catalog = catalog_index();
    catalog.by_id.get(id).map(|index| &catalog.effects[*index])
}

pub fn find_by_algorithm(algorithm: &str) -> Option<&'static EnhancementEffect> {
    catalog()
        .iter()
        .find(|effect| effect.algorithm == algorithm)
}

/// Replaces every stored effect with its current catalog entry and drops ids the
/// catalog no longer knows.
pub fn synchronize_custom_modes(modes: &[CustomMode]) -> Vec<CustomMode> {
    modes
        .iter()
        .map(|mode| CustomMode {
            id: mode.id.clone(),
            name: mode.name.clone(),
            effects: mode
                .effects
                .iter()
                .filter_map(|effect| find_by_id(&effect.id).cloned())
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        assert_eq!(catalog().len(), CATALOG_ENTRIES.len());
        assert_eq!(catalog_index().by_id.len(), catalog().len());
    }

    #[test]
    fn upscalers_declare_their_factor() {
        let x2 = find_by_id("anime4k/Upscale/CNNx2VL").expect("catalog entry");
        assert_eq!(x2.upscale_factor(), 2);
        let x4 = find_by_algorithm("GANx4UUL").expect("catalog entry");
        assert_eq!(x4.upscale_factor(), 4);
        let restore = find_by_id("anime4k/Restore/CNNM").expect("catalog entry");
        assert_eq!(restore.upscale_factor(), 1);
    }

    #[test]
    fn downscale_is_not_user_selectable() {
        assert!(find_by_algorithm("Downscale").is_none());
    }

    #[test]
    fn synchronization_refreshes_and_filters() {
        let mut stale = find_by_id("anime4k/Restore/CNNVL").unwrap().clone();
        stale.name = "Old name".to_owned();
        let unknown = EnhancementEffect {
            id: "anime4k/Restore/Removed".to_owned(),
            name: "Removed".to_owned(),
            algorithm: "Removed".to_owned(),
            upscale_factor: None,
            params: BTreeMap::new(),
        };
        let modes = vec![CustomMode {
            id: "custom-1".to_owned(),
            name: "Mine".to_owned(),
            effects: vec![stale, unknown],
        }];

        let synced = synchronize_custom_modes(&modes);
        assert_eq!(synced[0].effects.len(), 1);
        assert_eq!(synced[0].effects[0].name, "Restore CNN (VL)");
    }
}
