//! Translation of quasi-species tree state into batched backend operations.
//!
//! Buffer layout, for a tree with `L` haplotype tips and `N = 2L - 1` nodes:
//!
//! - partials: logical slots `0..L` hold the tip data, `L..2L` a mirrored
//!   copy of it, and `2L + n` the working partials of node `n`. Only the
//!   working slots are double-buffered.
//! - matrices: logical slot `n < L` holds tip `n`'s aggregate no-change
//!   matrix, `L + n` an identity matrix, and `2L + n` the branch matrix
//!   above node `n`.
//! - scale factors: logical slot `n` per node, slot `N` accumulates.
//!
//! A branch fully inside a haplotype's lineage gets an identity matrix: all
//! evolution along duplicate lineages is folded into the tip's no-change
//! matrix, and the partial branch between the lineage-start height and the
//! enclosing node carries the only real transition.

use crate::alignment::Alignment;
use crate::error::Result;
use crate::likelihood::backend::{AllocationRequest, LikelihoodBackend, PartialsOperation};
use crate::likelihood::buffers::BufferIndexAllocator;
use crate::likelihood::{EngineConfig, RescalingScheme};
use crate::model::{SiteModel, SubstitutionModel};
use crate::tree::{HaploId, NodeId, QuasiSpeciesTree};
use tracing::{debug, warn};

pub struct QuasiSpeciesLikelihood<B, M> {
    tree: QuasiSpeciesTree,
    alignment: Alignment,
    model: M,
    site_model: SiteModel,
    config: EngineConfig,
    backend: B,
    partials: BufferIndexAllocator,
    matrices: BufferIndexAllocator,
    eigen: BufferIndexAllocator,
    scale: BufferIndexAllocator,
    /// Backend category rates (invariant category stripped), change-detected.
    category_rates: Vec<f64>,
    category_weights: Vec<f64>,
    frequencies: Vec<f64>,
    pattern_log_likelihoods: Vec<f64>,
    scheme: RescalingScheme,
    /// The backend rescales internally; the engine never issues scale ops.
    backend_rescales: bool,
    ever_underflowed: bool,
    rescaling_count: usize,
    rescaling_count_inner: usize,
}

/// Category rates and weights as fed to the backend: the zero-rate
/// invariant category is handled analytically at the root and stripped here.
fn variable_categories(site_model: &SiteModel) -> (Vec<f64>, Vec<f64>) {
    site_model
        .category_rates()
        .iter()
        .zip(site_model.category_proportions())
        .filter(|(&rate, _)| rate != 0.0)
        .map(|(&rate, &weight)| (rate, weight))
        .unzip()
}

impl<B: LikelihoodBackend, M: SubstitutionModel> QuasiSpeciesLikelihood<B, M> {
    /// Wire a tree, its alignment and the substitution machinery to a
    /// backend instance. Allocates all buffers and uploads the static data
    /// (tip characters, pattern weights, identity matrices).
    pub fn new(
        tree: QuasiSpeciesTree,
        alignment: Alignment,
        model: M,
        site_model: SiteModel,
        config: EngineConfig,
        mut backend: B,
    ) -> Result<Self> {
        assert_eq!(model.state_count(), alignment.state_count());

        let leaf_count = tree.leaf_count();
        let node_count = tree.node_count();
        let state_count = model.state_count();
        let pattern_count = alignment.pattern_count();
        let (category_rates, category_weights) = variable_categories(&site_model);

        let partials = BufferIndexAllocator::new(4 * leaf_count, 2 * leaf_count);
        let matrices = BufferIndexAllocator::new(4 * leaf_count, 0);
        let eigen = BufferIndexAllocator::new(1, 0);
        let scale = BufferIndexAllocator::new(node_count + 1, 0);

        let use_partials = config.use_tip_likelihoods || config.use_ambiguities;
        backend.allocate(&AllocationRequest {
            tip_count: 2 * leaf_count,
            partials_buffers: partials.buffer_count(),
            compact_buffers: if use_partials { 0 } else { 2 * leaf_count },
            state_count,
            pattern_count,
            eigen_buffers: eigen.buffer_count(),
            matrix_buffers: matrices.buffer_count(),
            category_count: category_rates.len(),
            scale_buffers: scale.buffer_count(),
            resources: config.resources.clone(),
        })?;

        // tip characters, once into the primary and once into the mirrored
        // slot
        for tip in 0..leaf_count {
            let label = tree
                .node(NodeId::from_usize(tip))
                .label()
                .expect("tip node carries no label");
            let row = alignment.taxon_index(label)?;
            if use_partials {
                let mut data = vec![0.0; category_rates.len() * pattern_count * state_count];
                for category in 0..category_rates.len() {
                    for pattern in 0..pattern_count {
                        let members = Alignment::state_set(alignment.mask(row, pattern));
                        let offset = (category * pattern_count + pattern) * state_count;
                        for (state, &present) in members.iter().enumerate() {
                            data[offset + state] = if present { 1.0 } else { 0.0 };
                        }
                    }
                }
                backend.set_tip_partials(tip, &data);
                backend.set_tip_partials(leaf_count + tip, &data);
            } else {
                // ambiguity codes degrade to fully unknown here
                let states: Vec<usize> = (0..pattern_count)
                    .map(|pattern| {
                        Alignment::single_state(alignment.mask(row, pattern))
                            .unwrap_or(state_count)
                    })
                    .collect();
                backend.set_tip_states(tip, &states);
                backend.set_tip_states(leaf_count + tip, &states);
            }
        }

        let identity = {
            let mut out = vec![0.0; category_rates.len() * state_count * state_count];
            for category in 0..category_rates.len() {
                for state in 0..state_count {
                    out[(category * state_count + state) * state_count + state] = 1.0;
                }
            }
            out
        };
        // the mirrored tip matrices stay identity forever (their logical
        // indices are never flipped)
        for tip in 0..leaf_count {
            backend.set_transition_matrix(matrices.current_slot(leaf_count + tip), &identity);
        }

        backend.set_pattern_weights(alignment.pattern_weights());
        backend.set_category_rates(&category_rates);
        backend.set_category_weights(0, &category_weights);
        backend.set_state_frequencies(0, model.frequencies());

        let (scheme, backend_rescales) = match config.rescaling {
            RescalingScheme::Auto if backend.supports_auto_rescaling() => {
                (RescalingScheme::Auto, true)
            }
            RescalingScheme::Auto => {
                warn!("backend does not rescale automatically, falling back to dynamic rescaling");
                (RescalingScheme::Dynamic, false)
            }
            scheme => (scheme, false),
        };

        let frequencies = model.frequencies().to_vec();
        let mut engine = Self {
            tree,
            alignment,
            model,
            site_model,
            config,
            backend,
            partials,
            matrices,
            eigen,
            scale,
            category_rates,
            category_weights,
            frequencies,
            pattern_log_likelihoods: vec![0.0; pattern_count],
            scheme,
            backend_rescales,
            ever_underflowed: false,
            rescaling_count: 0,
            rescaling_count_inner: 0,
        };
        engine.tree.make_all_dirty();
        Ok(engine)
    }

    pub fn tree(&self) -> &QuasiSpeciesTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut QuasiSpeciesTree {
        &mut self.tree
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn alignment(&self) -> &Alignment {
        &self.alignment
    }

    pub fn site_model_mut(&mut self) -> &mut SiteModel {
        &mut self.site_model
    }

    /// Per-pattern log-likelihoods of the most recent evaluation, including
    /// the invariant-site adjustment.
    pub fn pattern_log_likelihoods(&self) -> &[f64] {
        &self.pattern_log_likelihoods
    }

    /// Snapshot the mutable evaluation state: tree, buffer assignments and
    /// scale buffer selection.
    pub fn store(&mut self) {
        self.tree.store();
        self.partials.store();
        self.matrices.store();
        self.eigen.store();
        self.scale.store();
    }

    /// Reject the changes since the last [`store`](Self::store). The backend
    /// buffers written in between live in the inactive halves afterwards, so
    /// the next evaluation resumes from the stored state without recomputing
    /// anything.
    pub fn restore(&mut self) {
        self.tree.restore();
        self.partials.restore();
        self.matrices.restore();
        self.eigen.restore();
        self.scale.restore();
    }

    /// Compute the log-likelihood of the tree under the current model state.
    ///
    /// Only dirty parts of the tree are recomputed. Underflow to a
    /// non-finite root likelihood triggers a single rescaled retry (except
    /// under [`RescalingScheme::None`]); if the retry underflows too, the
    /// result is negative infinity.
    pub fn evaluate(&mut self) -> f64 {
        let (use_scale, recompute_scale) = self.rescaling_plan();
        if use_scale && recompute_scale {
            self.tree.make_all_dirty();
        }
        self.sync_site_model();

        let operations = self.traverse(true, use_scale, recompute_scale);
        debug!(
            operations = operations.len(),
            use_scale, recompute_scale, "evaluating tree likelihood"
        );

        let cumulative = self.tree.node_count();
        if use_scale && recompute_scale {
            self.scale.flip(cumulative);
            self.backend
                .reset_scale_factors(self.scale.current_slot(cumulative));
        }
        self.backend.update_partials(&operations);
        if use_scale && recompute_scale {
            let buffers: Vec<usize> = operations.iter().filter_map(|op| op.write_scale).collect();
            self.backend
                .accumulate_scale_factors(&buffers, self.scale.current_slot(cumulative));
        }

        let root_working = 2 * self.tree.leaf_count() + self.tree.root().index();
        let root_slot = self.partials.current_slot(root_working);
        let scale_arg = if use_scale {
            Some(self.scale.current_slot(cumulative))
        } else {
            None
        };
        let mut log_likelihood = self
            .backend
            .root_log_likelihood(root_slot, 0, 0, scale_arg);

        if !log_likelihood.is_finite()
            && !self.backend_rescales
            && self.scheme != RescalingScheme::None
        {
            debug!("root likelihood underflowed, retrying with rescaling");
            self.ever_underflowed = true;
            self.tree.make_all_dirty();
            // no flips: overwrite the buffers of the failed attempt
            let operations = self.traverse(false, true, true);
            let cumulative_slot = self.scale.current_slot(cumulative);
            self.backend.reset_scale_factors(cumulative_slot);
            self.backend.update_partials(&operations);
            let buffers: Vec<usize> =
                operations.iter().filter_map(|op| op.write_scale).collect();
            self.backend
                .accumulate_scale_factors(&buffers, cumulative_slot);
            log_likelihood =
                self.backend
                    .root_log_likelihood(root_slot, 0, 0, Some(cumulative_slot));
        }

        self.tree.make_all_clean();
        if !log_likelihood.is_finite() {
            self.ever_underflowed = true;
            return f64::NEG_INFINITY;
        }
        self.apply_corrections(log_likelihood)
    }

    /// Whether this evaluation scales at all, and whether it recomputes the
    /// scale factors or coasts on cached ones.
    fn rescaling_plan(&mut self) -> (bool, bool) {
        match self.scheme {
            RescalingScheme::None | RescalingScheme::Auto => (false, false),
            RescalingScheme::Always => (true, true),
            RescalingScheme::Delayed => (self.ever_underflowed, self.ever_underflowed),
            RescalingScheme::Dynamic => {
                if !self.ever_underflowed {
                    return (false, false);
                }
                let recompute = self.rescaling_count_inner < self.config.rescale_times;
                if recompute {
                    self.rescaling_count_inner += 1;
                }
                self.rescaling_count += 1;
                if self.rescaling_count > self.config.rescale_frequency {
                    self.rescaling_count = 0;
                    self.rescaling_count_inner = 0;
                }
                (true, recompute)
            }
        }
    }

    /// Push site-model and frequency changes to the backend. Rate changes
    /// invalidate every transition matrix.
    fn sync_site_model(&mut self) {
        let (rates, weights) = variable_categories(&self.site_model);
        assert_eq!(
            rates.len(),
            self.category_rates.len(),
            "category count is fixed at backend allocation"
        );
        if rates != self.category_rates || weights != self.category_weights {
            self.backend.set_category_rates(&rates);
            self.backend.set_category_weights(0, &weights);
            self.category_rates = rates;
            self.category_weights = weights;
            self.tree.make_all_dirty();
        }
        if self.model.frequencies() != self.frequencies.as_slice() {
            self.frequencies = self.model.frequencies().to_vec();
            self.backend.set_state_frequencies(0, &self.frequencies);
        }
    }

    /// Refresh transition matrices of dirty nodes and queue partials
    /// updates, bottom-up. With `flip` unset, all writes overwrite the
    /// currently active buffer halves (the underflow-retry path).
    fn traverse(
        &mut self,
        flip: bool,
        use_scale: bool,
        recompute_scale: bool,
    ) -> Vec<PartialsOperation> {
        let leaf_count = self.tree.leaf_count();
        let working = |n: usize| 2 * leaf_count + n;
        let mut updated = vec![false; self.tree.node_count()];
        let mut operations = Vec::new();

        for id in self.tree.post_order() {
            let n = id.index();
            let node = self.tree.node(id);
            let is_leaf = node.is_leaf();
            let dirty = node.is_dirty();
            let children = (node.left(), node.right());
            let children_updated = match children {
                (Some(l), Some(r)) => updated[l.index()] || updated[r.index()],
                _ => false,
            };

            if dirty {
                let matrix = self.branch_matrix(id);
                if flip {
                    self.matrices.flip(working(n));
                }
                self.backend
                    .set_transition_matrix(self.matrices.current_slot(working(n)), &matrix);
                if is_leaf {
                    let matrix = self.no_change_matrix(HaploId::from_usize(n));
                    if flip {
                        self.matrices.flip(n);
                    }
                    self.backend
                        .set_transition_matrix(self.matrices.current_slot(n), &matrix);
                }
            }

            if dirty || children_updated {
                if flip {
                    self.partials.flip(working(n));
                }
                let (write_scale, read_scale) = if !use_scale {
                    (None, None)
                } else if recompute_scale {
                    if flip {
                        self.scale.flip(n);
                    }
                    (Some(self.scale.current_slot(n)), None)
                } else {
                    (None, Some(self.scale.current_slot(n)))
                };

                let operation = if is_leaf {
                    PartialsOperation {
                        destination: self.partials.current_slot(working(n)),
                        write_scale,
                        read_scale,
                        source1: self.partials.current_slot(n),
                        matrix1: self.matrices.current_slot(n),
                        source2: self.partials.current_slot(leaf_count + n),
                        matrix2: self.matrices.current_slot(leaf_count + n),
                    }
                } else {
                    let (l, r) = (children.0.unwrap().index(), children.1.unwrap().index());
                    PartialsOperation {
                        destination: self.partials.current_slot(working(n)),
                        write_scale,
                        read_scale,
                        source1: self.partials.current_slot(working(l)),
                        matrix1: self.matrices.current_slot(working(l)),
                        source2: self.partials.current_slot(working(r)),
                        matrix2: self.matrices.current_slot(working(r)),
                    }
                };
                operations.push(operation);
                updated[n] = true;
            }
        }
        operations
    }

    /// The real transition span of the branch above a node, or `None` where
    /// the branch carries an identity matrix: the root, and branches fully
    /// inside a continuing haplotype's lineage.
    fn branch_span(&self, id: NodeId) -> Option<(f64, f64)> {
        let node = self.tree.node(id);
        let parent = node.parent()?;
        let parent_height = self.tree.node(parent).height();
        if let Some(haplo) = node.haplo_above() {
            // partial branch from the parent down to the lineage start
            Some((parent_height, self.tree.ledger(haplo).lineage_start()))
        } else if node.continuing_haplo().is_some() {
            None
        } else {
            Some((parent_height, node.height()))
        }
    }

    /// Category-stacked transition matrix for the branch above a node.
    fn branch_matrix(&self, id: NodeId) -> Vec<f64> {
        let s = self.model.state_count();
        let mut out = vec![0.0; self.category_rates.len() * s * s];
        match self.branch_span(id) {
            Some((start, end)) => {
                for (category, &rate) in self.category_rates.iter().enumerate() {
                    self.model.transition_probabilities(
                        start,
                        end,
                        rate * self.config.clock_rate,
                        &mut out[category * s * s..(category + 1) * s * s],
                    );
                }
            }
            None => {
                for category in 0..self.category_rates.len() {
                    for state in 0..s {
                        out[(category * s + state) * s + state] = 1.0;
                    }
                }
            }
        }
        out
    }

    /// Diagonal matrix with the probability that a haplotype's state
    /// survives unchanged over the summed branch length of all its duplicate
    /// lineages.
    fn no_change_matrix(&self, haplo: HaploId) -> Vec<f64> {
        let s = self.model.state_count();
        let mut diagonal_rates = vec![0.0; s];
        self.model.no_change_rates(&mut diagonal_rates);
        let length = self.tree.ledger(haplo).total_branch_length() * self.config.clock_rate;

        let mut out = vec![0.0; self.category_rates.len() * s * s];
        for (category, &rate) in self.category_rates.iter().enumerate() {
            for state in 0..s {
                out[(category * s + state) * s + state] =
                    (length * rate * diagonal_rates[state]).exp();
            }
        }
        out
    }

    /// Invariant-site and ascertainment adjustments on top of the backend's
    /// raw per-pattern log-likelihoods.
    fn apply_corrections(&mut self, log_likelihood: f64) -> f64 {
        self.backend
            .site_log_likelihoods(&mut self.pattern_log_likelihoods);
        let mut total = log_likelihood;

        let proportion_invariant = self.site_model.proportion_invariant();
        if proportion_invariant > 0.0 {
            let frequencies = self.frequencies.clone();
            let mut additions = vec![0.0; self.pattern_log_likelihoods.len()];
            for (pattern, state) in self.alignment.constant_patterns() {
                additions[pattern] += proportion_invariant * frequencies[state];
            }
            for (pattern, &addition) in additions.iter().enumerate() {
                if addition > 0.0 {
                    let pll = &mut self.pattern_log_likelihoods[pattern];
                    *pll = (pll.exp() + addition).ln();
                }
            }
            total = self
                .pattern_log_likelihoods
                .iter()
                .zip(self.alignment.pattern_weights())
                .map(|(pll, weight)| pll * weight)
                .sum();
        }

        if self.alignment.is_ascertained() {
            let correction = self
                .alignment
                .ascertainment_correction(&self.pattern_log_likelihoods);
            total = self
                .pattern_log_likelihoods
                .iter()
                .zip(self.alignment.pattern_weights())
                .map(|(pll, weight)| (pll - correction) * weight)
                .sum();
        }

        total
    }
}
