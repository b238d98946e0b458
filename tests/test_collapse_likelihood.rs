//! End-to-end check of the collapse pipeline: a sample tree with duplicate
//! sequences collapses to a haplotype tree whose likelihood matches the
//! hand-derived closed form.

use quasitree::tree::cluster::upgma;
use quasitree::{EngineConfig, HaploId, QuasiSpeciesTree};
use std::collections::HashMap;

mod common;

#[test]
fn collapsed_duplicates_match_closed_form() {
    let (tree, alignment) = common::collapsed_duplicate_tree();

    assert_eq!(tree.leaf_count(), 2);
    assert_eq!(tree.total_attachment_counts(), 1);
    let ledger = tree.ledger(HaploId::from_usize(0));
    assert_eq!(ledger.tip_times(), &[0.0, 1.0]);
    assert_eq!(ledger.lineage_start(), 2.0);
    // lineages: 2.0 -> 0.0 and 2.0 -> 1.0
    assert!((ledger.total_branch_length() - 3.0).abs() < 1e-12);

    let mut engine = common::jukes_cantor_engine(tree, alignment, EngineConfig::default());
    let logl = engine.evaluate();

    // haplotype 0 starts at 2.0 below the root at 3.0: its tip carries a
    // no-change factor over branch length 3 and a transition over the
    // segment 3.0 -> 2.0. haplotype 1 is a singleton with the full branch
    // 3.0 -> 0.0.
    let pairing = common::jc_p_same(1.0) * common::jc_p_diff(3.0)
        + common::jc_p_diff(1.0) * common::jc_p_same(3.0)
        + 2.0 * common::jc_p_diff(1.0) * common::jc_p_diff(3.0);
    let expected = (0.25 * (-3.0f64).exp() * pairing).ln();
    assert!((logl - expected).abs() < 1e-12, "{logl} vs {expected}");
}

#[test]
fn clustered_counts_pipeline_produces_a_finite_likelihood() {
    let alignment = quasitree::Alignment::from_sequences(vec![
        ("a".to_string(), "AAAA"),
        ("c".to_string(), "CCAA"),
    ]);
    let backbone = upgma(&alignment, &[0.0, 0.0]);
    let counts: HashMap<String, usize> =
        [("a".to_string(), 3), ("c".to_string(), 1)].into_iter().collect();
    let tree =
        QuasiSpeciesTree::collapse_backbone(&backbone, &alignment, Some(&counts), 10.0).unwrap();

    assert_eq!(tree.leaf_count(), 2);
    assert_eq!(tree.total_attachment_counts(), 2);
    // synthesized attachment heights lie strictly inside the enclosing branch
    let ledger = tree.ledger(HaploId::from_usize(0));
    let parent_height = tree.root_height();
    assert!(ledger
        .attachment_times()
        .iter()
        .all(|&t| t > 0.0 && t < parent_height));

    let mut engine = common::jukes_cantor_engine(tree, alignment, EngineConfig::default());
    let logl = engine.evaluate();
    assert!(logl.is_finite());
    assert!(logl < 0.0);
}

#[test]
fn duplicate_counts_scale_the_no_change_weight() {
    // the same two-haplotype topology with more duplicates of haplotype 0
    // must be less likely under a site where the haplotypes differ, since
    // more lineage length has to survive without change
    let alignment = quasitree::Alignment::from_sequences(vec![
        ("a".to_string(), "A"),
        ("c".to_string(), "C"),
    ]);
    let few: HashMap<String, usize> =
        [("a".to_string(), 2), ("c".to_string(), 1)].into_iter().collect();
    let many: HashMap<String, usize> =
        [("a".to_string(), 6), ("c".to_string(), 1)].into_iter().collect();

    let mut logls = Vec::new();
    for counts in [&few, &many] {
        let mut backbone = quasitree::tree::collapse::Backbone::new();
        let a = backbone.leaf("a", 0.0);
        let c = backbone.leaf("c", 0.0);
        backbone.join(a, c, 2.0);
        let tree =
            QuasiSpeciesTree::collapse_backbone(&backbone, &alignment, Some(counts), 10.0)
                .unwrap();
        let mut engine =
            common::jukes_cantor_engine(tree, alignment.clone(), EngineConfig::default());
        logls.push(engine.evaluate());
    }
    assert!(logls[1] < logls[0]);
}
