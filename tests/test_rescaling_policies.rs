//! The engine's rescaling policies, observed through the backend's
//! scale-operation counters and a backend wrapper that forces underflow.

use quasitree::model::{JukesCantor, SiteModel};
use quasitree::{EngineConfig, QuasiSpeciesLikelihood, RescalingScheme};

mod common;

fn engine_with_failing_backend(
    rescaling: RescalingScheme,
    rescale_times: usize,
    failures: usize,
) -> QuasiSpeciesLikelihood<common::UnderflowingBackend, JukesCantor> {
    let (tree, alignment) = common::collapsed_duplicate_tree();
    QuasiSpeciesLikelihood::new(
        tree,
        alignment,
        JukesCantor::new(4),
        SiteModel::uniform(),
        EngineConfig {
            rescaling,
            rescale_times,
            rescale_frequency: 1000,
            ..EngineConfig::default()
        },
        common::UnderflowingBackend::new(failures),
    )
    .unwrap()
}

#[test]
fn none_policy_never_scales_and_reports_underflow() {
    let mut engine = engine_with_failing_backend(RescalingScheme::None, 1, 1);

    assert_eq!(engine.evaluate(), f64::NEG_INFINITY);
    assert_eq!(engine.backend().inner().reset_scale_calls(), 0);
    assert_eq!(engine.backend().inner().accumulate_scale_calls(), 0);

    // the forced failure is spent: subsequent evaluations succeed, still
    // without any scaling
    assert!(engine.evaluate().is_finite());
    assert_eq!(engine.backend().inner().reset_scale_calls(), 0);
}

#[test]
fn dynamic_policy_retries_recomputes_then_coasts() {
    let mut engine = engine_with_failing_backend(RescalingScheme::Dynamic, 2, 1);
    let root = engine.tree().root();

    // first evaluation underflows and is retried once with fresh factors
    let first = engine.evaluate();
    assert!(first.is_finite());
    assert_eq!(engine.backend().inner().reset_scale_calls(), 1);
    assert_eq!(engine.backend().inner().accumulate_scale_calls(), 1);

    // the next `rescale_times` evaluations recompute the factors
    engine.evaluate();
    engine.evaluate();
    assert_eq!(engine.backend().inner().reset_scale_calls(), 3);

    // after the burst the engine coasts on cached factors, even across
    // genuine tree changes
    engine.tree_mut().set_height(root, 3.5);
    let coasted = engine.evaluate();
    assert!(coasted.is_finite());
    engine.evaluate();
    assert_eq!(engine.backend().inner().reset_scale_calls(), 3);
    assert_eq!(engine.backend().inner().accumulate_scale_calls(), 3);
}

#[test]
fn delayed_policy_recomputes_every_evaluation_after_underflow() {
    let mut engine = engine_with_failing_backend(RescalingScheme::Delayed, 1, 1);

    assert!(engine.evaluate().is_finite());
    assert_eq!(engine.backend().inner().reset_scale_calls(), 1);

    engine.evaluate();
    engine.evaluate();
    assert_eq!(engine.backend().inner().reset_scale_calls(), 3);
    assert_eq!(engine.backend().inner().accumulate_scale_calls(), 3);
}

#[test]
fn rescaled_likelihood_matches_the_unscaled_value() {
    let (tree, alignment) = common::collapsed_duplicate_tree();
    let unscaled = common::jukes_cantor_engine(
        tree,
        alignment,
        EngineConfig {
            rescaling: RescalingScheme::None,
            ..EngineConfig::default()
        },
    )
    .evaluate();

    let mut engine = engine_with_failing_backend(RescalingScheme::Dynamic, 2, 1);
    let retried = engine.evaluate();
    assert!((retried - unscaled).abs() < 1e-12);
    // the recompute and coast evaluations agree with it as well
    engine.evaluate();
    let recomputed = engine.evaluate();
    engine.evaluate();
    let coasted = engine.evaluate();
    assert!((recomputed - unscaled).abs() < 1e-12);
    assert!((coasted - unscaled).abs() < 1e-12);
}
