//! The flattened serialized form of a quasi-species tree: a newick-like
//! string in which every haplotype tip carries its three ledger lists as
//! bracketed metadata. Used for state files and tree logs; a round trip
//! reproduces the ledgers and node annotations.

use crate::error::{Error, Result};
use crate::tree::{AttachmentLedger, NodeId, QuasiSpeciesNode, QuasiSpeciesTree};
use std::fmt::Write as _;

/// Render the tree in flattened form:
/// `(tip[&AttachTimes={..},TipTimes={..},TipCounts={..}]:len,...):len;`
pub fn write_flat(tree: &QuasiSpeciesTree) -> String {
    let mut out = String::new();
    write_node(tree, tree.root(), &mut out);
    out.push(';');
    out
}

fn write_node(tree: &QuasiSpeciesTree, id: NodeId, out: &mut String) {
    let node = tree.node(id);
    if let (Some(left), Some(right)) = (node.left(), node.right()) {
        out.push('(');
        write_node(tree, left, out);
        let _ = write!(out, ":{}", node.height() - tree.node(left).height());
        out.push(',');
        write_node(tree, right, out);
        let _ = write!(out, ":{}", node.height() - tree.node(right).height());
        out.push(')');
    } else {
        let ledger = node.ledger().expect("tip node carries no ledger");
        out.push_str(node.label().unwrap_or(""));
        let _ = write!(
            out,
            "[&AttachTimes={{{}}},TipTimes={{{}}},TipCounts={{{}}}]",
            join_floats(ledger.attachment_times()),
            join_floats(ledger.tip_times()),
            ledger
                .tip_counts()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
}

fn join_floats(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Nexus tree-log preamble with a translate block mapping tip numbers to
/// taxon labels.
pub fn nexus_header(tree: &QuasiSpeciesTree) -> String {
    let mut out = String::from("#NEXUS\n\nBegin trees;\n\tTranslate\n");
    for tip in 0..tree.leaf_count() {
        let label = tree
            .node(NodeId::from_usize(tip))
            .label()
            .unwrap_or("")
            .to_string();
        let separator = if tip + 1 < tree.leaf_count() { "," } else { "" };
        let _ = writeln!(out, "\t\t{} {}{}", tip + 1, label, separator);
    }
    out.push_str(";\n");
    out
}

/// One logged tree state in the nexus log.
pub fn nexus_tree_entry(sample: usize, tree: &QuasiSpeciesTree) -> String {
    format!("tree STATE_{} = {}\n", sample, write_flat(tree))
}

/// Nexus tree-log closer.
pub fn nexus_footer() -> &'static str {
    "End;\n"
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

/// A parsed flattened node before height reconstruction: children with their
/// branch lengths, or a labeled tip with its ledger.
struct FlatNode {
    children: Option<(Box<FlatNode>, f64, Box<FlatNode>, f64)>,
    label: String,
    ledger: Option<AttachmentLedger>,
}

impl QuasiSpeciesTree {
    /// Reconstruct a tree from its flattened serialized form. Ledgers are
    /// read from the tip metadata directly, skipping distance-based
    /// synthesis; absolute heights are anchored at the tips' most recent
    /// sampling times.
    pub fn from_flat(input: &str, origin: f64) -> Result<Self> {
        let mut parser = Parser {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        };
        let root = parser.parse_node()?;
        parser.skip_whitespace();
        if !matches!(parser.bytes.get(parser.pos), Some(b';')) {
            return Err(Error::FlatParse("missing trailing semicolon".to_string()));
        }

        let mut nodes = Vec::new();
        let mut tips = 0;
        build_arena(&root, &mut nodes, &mut tips)?;
        let leaf_count = tips;

        // renumber: tips in reading order, internal nodes post-order
        let mut mapping = vec![usize::MAX; nodes.len()];
        let mut next_tip = 0;
        let mut next_internal = leaf_count;
        for (i, node) in nodes.iter().enumerate() {
            if node.is_leaf() {
                mapping[i] = next_tip;
                next_tip += 1;
            } else {
                mapping[i] = next_internal;
                next_internal += 1;
            }
        }
        let remap = |id: Option<NodeId>| id.map(|n| NodeId::from_usize(mapping[n.index()]));
        let root_index = mapping[nodes.len() - 1];
        let mut arena: Vec<Option<QuasiSpeciesNode>> = (0..nodes.len()).map(|_| None).collect();
        for (i, mut node) in nodes.into_iter().enumerate() {
            node.parent = remap(node.parent);
            node.left = remap(node.left);
            node.right = remap(node.right);
            arena[mapping[i]] = Some(node);
        }
        let arena: Vec<QuasiSpeciesNode> = arena
            .into_iter()
            .map(|n| n.expect("renumbering left a hole in the arena"))
            .collect();

        Self::from_arena(arena, NodeId::from_usize(root_index), leaf_count, origin)
    }
}

/// Convert the parsed structure into an arena in post-order (root last),
/// reconstructing absolute heights bottom-up from the tips' most recent
/// sampling times and the branch lengths.
fn build_arena(
    flat: &FlatNode,
    nodes: &mut Vec<QuasiSpeciesNode>,
    tips: &mut usize,
) -> Result<usize> {
    match &flat.children {
        None => {
            let ledger = flat.ledger.clone().ok_or_else(|| {
                Error::UnrecognizedSerializedMetadata {
                    taxon: flat.label.clone(),
                    detail: "tip carries no ledger metadata".to_string(),
                }
            })?;
            let height = ledger
                .tip_times()
                .iter()
                .cloned()
                .fold(f64::INFINITY, f64::min);
            let index = nodes.len();
            nodes.push(QuasiSpeciesNode::tip(height, flat.label.clone(), ledger));
            *tips += 1;
            Ok(index)
        }
        Some((left, left_len, right, right_len)) => {
            let l = build_arena(left, nodes, tips)?;
            let r = build_arena(right, nodes, tips)?;
            let height = nodes[l].height + left_len;
            let other = nodes[r].height + right_len;
            if (height - other).abs() > 1e-6 {
                return Err(Error::FlatParse(format!(
                    "inconsistent heights at internal node: {height} vs {other}"
                )));
            }
            let index = nodes.len();
            nodes.push(QuasiSpeciesNode::internal(
                height,
                NodeId::from_usize(l),
                NodeId::from_usize(r),
            ));
            nodes[l].parent = Some(NodeId::from_usize(index));
            nodes[r].parent = Some(NodeId::from_usize(index));
            Ok(index)
        }
    }
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while matches!(self.bytes.get(self.pos), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        self.skip_whitespace();
        if self.bytes.get(self.pos) == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::FlatParse(format!(
                "expected {:?} at offset {}",
                expected as char, self.pos
            )))
        }
    }

    fn parse_node(&mut self) -> Result<FlatNode> {
        self.skip_whitespace();
        if self.bytes.get(self.pos) == Some(&b'(') {
            self.pos += 1;
            let left = self.parse_node()?;
            self.expect(b':')?;
            let left_len = self.parse_number()?;
            self.expect(b',')?;
            let right = self.parse_node()?;
            self.expect(b':')?;
            let right_len = self.parse_number()?;
            self.expect(b')')?;
            Ok(FlatNode {
                children: Some((Box::new(left), left_len, Box::new(right), right_len)),
                label: String::new(),
                ledger: None,
            })
        } else {
            let label = self.parse_label()?;
            let ledger = if self.bytes.get(self.pos) == Some(&b'[') {
                Some(self.parse_metadata(&label)?)
            } else {
                None
            };
            Ok(FlatNode {
                children: None,
                label,
                ledger,
            })
        }
    }

    fn parse_label(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(
            self.bytes.get(self.pos),
            Some(b) if !matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[')
        ) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Error::FlatParse(format!(
                "expected taxon label at offset {start}"
            )));
        }
        Ok(self.input[start..self.pos].trim().to_string())
    }

    fn parse_number(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while matches!(
            self.bytes.get(self.pos),
            Some(b) if b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        self.input[start..self.pos]
            .parse()
            .map_err(|_| Error::FlatParse(format!("malformed number at offset {start}")))
    }

    /// Parse `[&AttachTimes={..},TipTimes={..},TipCounts={..}]` into a
    /// ledger, restoring the list invariants with the multiset-preserving
    /// sorts.
    fn parse_metadata(&mut self, taxon: &str) -> Result<AttachmentLedger> {
        let meta_error = |detail: &str| Error::UnrecognizedSerializedMetadata {
            taxon: taxon.to_string(),
            detail: detail.to_string(),
        };
        let end = self.input[self.pos..]
            .find(']')
            .map(|i| self.pos + i)
            .ok_or_else(|| meta_error("unterminated metadata bracket"))?;
        let body = self.input[self.pos..end]
            .trim_start_matches('[')
            .trim_start_matches('&');
        self.pos = end + 1;

        let mut attach: Option<Vec<f64>> = None;
        let mut times: Option<Vec<f64>> = None;
        let mut counts: Option<Vec<usize>> = None;
        let mut rest = body;
        while !rest.is_empty() {
            let eq = rest
                .find('=')
                .ok_or_else(|| meta_error("metadata entry without '='"))?;
            let key = rest[..eq].trim();
            let after = &rest[eq + 1..];
            if !after.starts_with('{') {
                return Err(meta_error("metadata value must be a braced list"));
            }
            let close = after
                .find('}')
                .ok_or_else(|| meta_error("unterminated braced list"))?;
            let list = &after[1..close];
            match key {
                "AttachTimes" => attach = Some(parse_float_list(list, taxon)?),
                "TipTimes" => times = Some(parse_float_list(list, taxon)?),
                "TipCounts" => {
                    counts = Some(
                        parse_float_list(list, taxon)?
                            .into_iter()
                            .map(|v| v as usize)
                            .collect(),
                    )
                }
                other => {
                    return Err(meta_error(&format!("unknown metadata key {other:?}")));
                }
            }
            rest = after[close + 1..].trim_start_matches(',');
        }

        let (attach, times, counts) = match (attach, times, counts) {
            (Some(a), Some(t), Some(c)) => (a, t, c),
            _ => return Err(meta_error("missing one of AttachTimes/TipTimes/TipCounts")),
        };
        if times.len() != counts.len() || attach.len() != counts.iter().sum::<usize>() {
            return Err(meta_error("ledger list lengths are inconsistent"));
        }
        let mut ledger = AttachmentLedger::from_parts(attach, times, counts);
        ledger.sort_attachment_times();
        ledger.sort_tip_times();
        Ok(ledger)
    }
}

fn parse_float_list(list: &str, taxon: &str) -> Result<Vec<f64>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse()
                .map_err(|_| Error::UnrecognizedSerializedMetadata {
                    taxon: taxon.to_string(),
                    detail: format!("malformed list entry {:?}", s.trim()),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::tree::collapse::Backbone;
    use crate::tree::HaploId;

    fn collapsed_tree() -> QuasiSpeciesTree {
        let alignment = Alignment::from_sequences(vec![
            ("a".to_string(), "ACGT"),
            ("b".to_string(), "ACGT"),
            ("c".to_string(), "AGGT"),
        ]);
        let mut backbone = Backbone::new();
        let a = backbone.leaf("a", 0.0);
        let b = backbone.leaf("b", 1.0);
        let ab = backbone.join(a, b, 2.0);
        let c = backbone.leaf("c", 0.5);
        backbone.join(ab, c, 3.0);
        QuasiSpeciesTree::collapse_backbone(&backbone, &alignment, None, 10.0).unwrap()
    }

    #[test]
    fn round_trip_reproduces_ledgers_and_annotations() {
        let tree = collapsed_tree();
        let flat = write_flat(&tree);
        let parsed = QuasiSpeciesTree::from_flat(&flat, tree.origin()).unwrap();

        assert_eq!(parsed.leaf_count(), tree.leaf_count());
        for haplo in tree.haplotypes() {
            let original = tree.ledger(haplo);
            let restored = parsed.ledger(haplo);
            // attachment times compare as sets: the multiset-preserving sort
            // may place a different copy of the maximum in slot 0
            let mut a = original.attachment_times().to_vec();
            let mut b = restored.attachment_times().to_vec();
            a.sort_by(|x, y| x.partial_cmp(y).unwrap());
            b.sort_by(|x, y| x.partial_cmp(y).unwrap());
            assert_eq!(a, b);
            assert_eq!(original.tip_times(), restored.tip_times());
            assert_eq!(original.tip_counts(), restored.tip_counts());
        }
        for i in 0..tree.node_count() {
            let id = NodeId::from_usize(i);
            assert_eq!(tree.node(id).haplo_above(), parsed.node(id).haplo_above());
            assert_eq!(
                tree.node(id).continuing_haplo(),
                parsed.node(id).continuing_haplo()
            );
            assert!((tree.node(id).height() - parsed.node(id).height()).abs() < 1e-9);
        }
    }

    #[test]
    fn malformed_metadata_is_rejected() {
        let input = "(a[&AttachTimes={2},TipTimes={0},Bogus={1}]:2,c[&AttachTimes={3},TipTimes={0.5},TipCounts={1}]:2.5):1;";
        let result = QuasiSpeciesTree::from_flat(input, 10.0);
        assert!(matches!(
            result,
            Err(Error::UnrecognizedSerializedMetadata { .. })
        ));
    }

    #[test]
    fn nexus_log_sections() {
        let tree = collapsed_tree();
        let header = nexus_header(&tree);
        assert!(header.starts_with("#NEXUS"));
        assert!(header.contains("Translate"));
        let entry = nexus_tree_entry(100, &tree);
        assert!(entry.starts_with("tree STATE_100 = ("));
        assert!(entry.contains("AttachTimes"));
        assert_eq!(nexus_footer(), "End;\n");
    }

    #[test]
    fn single_tip_flat_form() {
        let input = "a[&AttachTimes={4,1,2},TipTimes={0,0.5},TipCounts={2,1}];";
        let tree = QuasiSpeciesTree::from_flat(input, 10.0).unwrap();
        assert_eq!(tree.leaf_count(), 1);
        let ledger = tree.ledger(HaploId::from_usize(0));
        assert_eq!(ledger.lineage_start(), 4.0);
        assert_eq!(ledger.tip_times(), &[0.0, 0.5]);
        assert_eq!(tree.haplo_count(HaploId::from_usize(0)), 3);
    }
}
