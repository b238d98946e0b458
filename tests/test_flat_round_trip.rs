//! Serializing a collapsed tree to its flattened form and reading it back
//! must reproduce the likelihood, not just the topology.

use quasitree::tree::flat::{nexus_tree_entry, write_flat};
use quasitree::{EngineConfig, QuasiSpeciesTree};

mod common;

#[test]
fn flat_round_trip_preserves_the_likelihood() {
    let (tree, alignment) = common::collapsed_duplicate_tree();
    let origin = tree.origin();

    let mut engine = common::jukes_cantor_engine(tree, alignment.clone(), EngineConfig::default());
    let original = engine.evaluate();

    let flat = write_flat(engine.tree());
    let parsed = QuasiSpeciesTree::from_flat(&flat, origin).unwrap();
    let mut reparsed_engine =
        common::jukes_cantor_engine(parsed, alignment, EngineConfig::default());
    let reparsed = reparsed_engine.evaluate();

    assert!(
        (original - reparsed).abs() < 1e-12,
        "{original} vs {reparsed}"
    );
}

#[test]
fn tree_log_entries_carry_the_ledgers() {
    let (tree, _) = common::collapsed_duplicate_tree();
    let entry = nexus_tree_entry(42, &tree);
    assert!(entry.starts_with("tree STATE_42 = "));
    assert!(entry.contains("AttachTimes"));
    assert!(entry.contains("TipCounts"));
    assert!(entry.trim_end().ends_with(';'));
}
