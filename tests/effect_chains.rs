use framelift::effect_chain::{self, effect_chain_summary, resolve};
use framelift::effects;
use framelift::schema::{BaseMode, PerformanceTier};

#[test]
fn every_builtin_pair_resolves_to_catalog_effects() {
    for base_mode in BaseMode::ALL {
        for tier in PerformanceTier::ALL {
            let chain = resolve(base_mode, tier);
            assert!(!chain.is_empty(), "{base_mode}/{tier} resolved to nothing");
            for effect in &chain {
                assert!(
                    effects::find_by_id(&effect.id).is_some(),
                    "{base_mode}/{tier} references unknown effect {}",
                    effect.id
                );
            }
        }
    }
}

#[test]
fn every_chain_starts_by_clamping_highlights() {
    for base_mode in BaseMode::ALL {
        for tier in PerformanceTier::ALL {
            let chain = resolve(base_mode, tier);
            assert_eq!(chain[0].algorithm, "ClampHighlights", "{base_mode}/{tier}");
        }
    }
}

#[test]
fn heavier_tiers_never_shrink_total_upscale() {
    for base_mode in BaseMode::ALL {
        let factors = PerformanceTier::ALL
            .into_iter()
            .map(|tier| {
                resolve(base_mode, tier)
                    .iter()
                    .map(|effect| effect.upscale_factor())
                    .product::<u32>()
            })
            .collect::<Vec<_>>();
        assert!(
            factors.windows(2).all(|pair| pair[0] <= pair[1]),
            "{base_mode}: {factors:?}"
        );
    }
}

#[test]
fn builtin_modes_resolve_against_tier_at_use_time() {
    let modes = effect_chain::builtin_modes();
    assert_eq!(modes.len(), 6);
    let aa = modes
        .iter()
        .find(|mode| mode.id == "builtin-mode-aa")
        .expect("A+A mode");
    assert_eq!(aa.base_mode, BaseMode::AA);
    assert_ne!(
        resolve(aa.base_mode, PerformanceTier::Performance),
        resolve(aa.base_mode, PerformanceTier::Ultra)
    );
}

#[test]
fn summary_lists_each_effect_in_order() {
    let chain = resolve(BaseMode::C, PerformanceTier::Balanced);
    let summary = effect_chain_summary(&chain);
    assert_eq!(summary.matches(" → ").count(), chain.len() - 1);
    assert_eq!(effect_chain_summary(&[]), "No effects");
}
