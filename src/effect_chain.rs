use std::sync::OnceLock;

use tracing::error;

use crate::effects;
use crate::schema::{BaseMode, BuiltInMode, EnhancementEffect, EnhancementMode, PerformanceTier};

pub const DEFAULT_MODE_ID: &str = "builtin-mode-a";

const CH: &str = "ClampHighlights";

/// Algorithm ids per (base mode, tier). Soft and denoise variants top out at VL,
/// so the heavier tiers reuse them.
fn template(base_mode: BaseMode, tier: PerformanceTier) -> &'static [&'static str] {
    use PerformanceTier::{Balanced, Performance, Quality, Ultra};

    match (base_mode, tier) {
        (BaseMode::A, Performance) => &[CH, "CNNM", "CNNx2M", "CNNx2M"],
        (BaseMode::A, Balanced) => &[CH, "CNNVL", "CNNx2VL", "CNNx2M"],
        (BaseMode::A, Quality) => &[CH, "CNNUL", "CNNx2UL", "CNNx2VL"],
        (BaseMode::A, Ultra) => &[CH, "CNNUL", "CNNx2UL", "CNNx2UL"],

        (BaseMode::B, Performance) => &[CH, "CNNSoftM", "CNNx2M", "CNNx2M"],
        (BaseMode::B, Balanced) => &[CH, "CNNSoftVL", "CNNx2VL", "CNNx2M"],
        (BaseMode::B, Quality) => &[CH, "CNNSoftVL", "CNNx2UL", "CNNx2VL"],
        (BaseMode::B, Ultra) => &[CH, "CNNSoftVL", "CNNx2UL", "CNNx2UL"],

        (BaseMode::C, Performance) => &[CH, "DenoiseCNNx2VL", "CNNx2M"],
        (BaseMode::C, Balanced) => &[CH, "DenoiseCNNx2VL", "CNNx2M"],
        (BaseMode::C, Quality) => &[CH, "DenoiseCNNx2VL", "CNNx2VL"],
        (BaseMode::C, Ultra) => &[CH, "DenoiseCNNx2VL", "CNNx2UL"],

        (BaseMode::AA, Performance) => &[CH, "CNNM", "CNNx2M", "CNNM", "CNNx2M"],
        (BaseMode::AA, Balanced) => &[CH, "CNNVL", "CNNx2VL", "CNNVL", "CNNx2M"],
        (BaseMode::AA, Quality) => &[CH, "CNNUL", "CNNx2UL", "CNNUL", "CNNx2VL"],
        (BaseMode::AA, Ultra) => &[
            CH, "CNNUL", "CNNx2UL", "CNNUL", "CNNx2UL", "CNNUL", "CNNx2VL",
        ],

        (BaseMode::BB, Performance) => &[CH, "CNNSoftM", "CNNx2M", "CNNSoftM", "CNNx2M"],
        (BaseMode::BB, Balanced) => &[CH, "CNNSoftVL", "CNNx2VL", "CNNSoftVL", "CNNx2M"],
        (BaseMode::BB, Quality) => &[CH, "CNNSoftVL", "CNNx2UL", "CNNSoftVL", "CNNx2VL"],
        (BaseMode::BB, Ultra) => &[CH, "CNNSoftVL", "CNNx2UL", "CNNSoftVL", "CNNx2UL"],

        (BaseMode::CA, Performance) => &[CH, "DenoiseCNNx2VL", "CNNM", "CNNx2M"],
        (BaseMode::CA, Balanced) => &[CH, "DenoiseCNNx2VL", "CNNVL", "CNNx2M"],
        (BaseMode::CA, Quality) => &[CH, "DenoiseCNNx2VL", "CNNUL", "CNNx2VL"],
        (BaseMode::CA, Ultra) => &[CH, "DenoiseCNNx2VL", "CNNUL", "CNNx2UL"],
    }
}

/// Concrete effect chain of a built-in base mode at the given tier.
///
/// Every table entry must name a catalog algorithm. A miss is a table bug: debug
/// builds panic, release builds log it and skip the entry.
pub fn resolve(base_mode: BaseMode, tier: PerformanceTier) -> Vec<EnhancementEffect> {
    template(base_mode, tier)
        .iter()
        .filter_map(|algorithm| {
            let effect = effects::find_by_algorithm(algorithm);
            debug_assert!(
                effect.is_some(),
                "chain template {base_mode}/{tier} references unknown algorithm '{algorithm}'"
            );
            if effect.is_none() {
                error!(%base_mode, %tier, algorithm, "chain template references unknown algorithm");
            }
            effect.cloned()
        })
        .collect()
}

pub fn builtin_modes() -> &'static [BuiltInMode] {
    static MODES: OnceLock<Vec<BuiltInMode>> = OnceLock::new();
    MODES.get_or_init(|| {
        BaseMode::ALL
            .into_iter()
            .map(|base_mode| BuiltInMode {
                id: format!(
                    "builtin-mode-{}",
                    base_mode.tag().replace('+', "").to_ascii_lowercase()
                ),
                base_mode,
                name: format!("Mode {}", base_mode.tag()),
            })
            .collect()
    })
}

/// Built-in modes resolve against the tier at use time; custom modes carry their own list.
pub fn effects_for_mode(mode: &EnhancementMode, tier: PerformanceTier) -> Vec<EnhancementEffect> {
    match mode {
        EnhancementMode::BuiltIn(builtin) => resolve(builtin.base_mode, tier),
        EnhancementMode::Custom(custom) => custom.effects.clone(),
    }
}

pub fn find_mode<'a>(modes: &'a [EnhancementMode], id: &str) -> Option<&'a EnhancementMode> {
    modes.iter().find(|mode| mode.id() == id)
}

/// Short human-readable description, e.g. `Restore CNN → Upscale CNN x2`.
pub fn effect_chain_summary(effects: &[EnhancementEffect]) -> String {
    if effects.is_empty() {
        return "No effects".to_owned();
    }
    effects
        .iter()
        .map(|effect| {
            effect
                .name
                .split('(')
                .next()
                .unwrap_or(&effect.name)
                .trim()
        })
        .collect::<Vec<_>>()
        .join(" → ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_mode_ids_follow_base_mode_tags() {
        let ids = builtin_modes()
            .iter()
            .map(|mode| mode.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            [
                "builtin-mode-a",
                "builtin-mode-b",
                "builtin-mode-c",
                "builtin-mode-aa",
                "builtin-mode-bb",
                "builtin-mode-ca"
            ]
        );
        assert_eq!(builtin_modes()[3].name, "Mode A+A");
        assert_eq!(builtin_modes()[0].id, DEFAULT_MODE_ID);
    }

    #[test]
    fn mode_a_balanced_matches_template() {
        let algorithms = resolve(BaseMode::A, PerformanceTier::Balanced)
            .into_iter()
            .map(|effect| effect.algorithm)
            .collect::<Vec<_>>();
        assert_eq!(algorithms, [CH, "CNNVL", "CNNx2VL", "CNNx2M"]);
    }

    #[test]
    fn ultra_double_restore_has_three_upscales() {
        let chain = resolve(BaseMode::AA, PerformanceTier::Ultra);
        assert_eq!(chain.len(), 7);
        let product: u32 = chain.iter().map(EnhancementEffect::upscale_factor).product();
        assert_eq!(product, 8);
    }

    #[test]
    fn summary_strips_variant_suffix() {
        let chain = resolve(BaseMode::C, PerformanceTier::Performance);
        assert_eq!(
            effect_chain_summary(&chain),
            "Helper: Clamp Highlights → Upscale & Denoise CNN x2 → Upscale CNN x2"
        );
        assert_eq!(effect_chain_summary(&[]), "No effects");
    }
}
