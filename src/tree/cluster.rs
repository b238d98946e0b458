//! Average-linkage (UPGMA) construction of a backbone tree from the
//! alignment alone, for runs that start without an input topology. The
//! resulting backbone is meant to be collapsed with explicit duplicate
//! counts, which re-synthesizes all attachment heights.

use crate::alignment::Alignment;
use crate::tree::collapse::Backbone;

/// Build a backbone by average-linkage clustering of the pairwise sequence
/// distances. `tip_heights` gives the sampling height per taxon (alignment
/// order); join heights are half the average distance, floored to stay above
/// the joined subtrees.
///
/// # Panics
/// Panics if `tip_heights` does not match the alignment's taxon count.
pub fn upgma(alignment: &Alignment, tip_heights: &[f64]) -> Backbone {
    assert_eq!(tip_heights.len(), alignment.taxon_count());

    let mut backbone = Backbone::new();
    let distances = alignment.distance_matrix();

    struct Cluster {
        node: usize,
        members: Vec<usize>,
        height: f64,
    }

    let mut clusters: Vec<Cluster> = alignment
        .taxa()
        .iter()
        .enumerate()
        .map(|(i, taxon)| Cluster {
            node: backbone.leaf(taxon, tip_heights[i]),
            members: vec![i],
            height: tip_heights[i],
        })
        .collect();

    let distances = &distances;
    let linkage = |a: &Cluster, b: &Cluster| -> f64 {
        let total: f64 = a
            .members
            .iter()
            .flat_map(|&i| b.members.iter().map(move |&j| distances[i][j]))
            .sum();
        total / (a.members.len() * b.members.len()) as f64
    };

    while clusters.len() > 1 {
        let mut best = (0, 1);
        let mut best_distance = f64::INFINITY;
        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let d = linkage(&clusters[i], &clusters[j]);
                if d < best_distance {
                    best_distance = d;
                    best = (i, j);
                }
            }
        }
        // best.0 < best.1, so removing the larger index first leaves the
        // smaller one in place
        let second = clusters.swap_remove(best.1);
        let first = clusters.swap_remove(best.0);
        let height = (best_distance / 2.0).max(first.height.max(second.height));
        let node = backbone.join(first.node, second.node, height);
        let mut members = first.members;
        members.extend(second.members);
        clusters.push(Cluster {
            node,
            members,
            height,
        });
    }

    backbone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_pair_joins_first() {
        let alignment = Alignment::from_sequences(vec![
            ("a".to_string(), "AAAA"),
            ("b".to_string(), "AAAT"),
            ("c".to_string(), "TTTT"),
        ]);
        let backbone = upgma(&alignment, &[0.0, 0.0, 0.0]);

        // leaves 0..3, join of (a, b) at index 3, root at index 4
        let tree = crate::tree::QuasiSpeciesTree::collapse_backbone(
            &backbone, &alignment, None, 100.0,
        )
        .unwrap();
        assert_eq!(tree.leaf_count(), 3);
        // a and b join below the root, c joins at the root; tip numbering
        // follows collapse discovery order, so look the tips up by label
        let tip = |label: &str| {
            (0..tree.leaf_count())
                .map(crate::tree::NodeId::from_usize)
                .find(|&id| tree.node(id).label() == Some(label))
                .unwrap()
        };
        let a_parent = tree.node(tree.node(tip("a")).parent().unwrap());
        assert!(a_parent.height() < tree.root_height());
        assert_eq!(tree.node(tip("a")).parent(), tree.node(tip("b")).parent());
        assert_eq!(tree.node(tip("c")).parent(), Some(tree.root()));
    }
}
