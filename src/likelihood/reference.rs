//! Pure Rust implementation of the backend protocol. Used by tests and as
//! the CPU fallback; it keeps per-pattern log scale factors exactly like the
//! accelerated backends, and counts the scale-factor operations so the
//! rescaling policies are observable.

use crate::error::{Error, Result};
use crate::likelihood::backend::{AllocationRequest, LikelihoodBackend, PartialsOperation};
use tracing::info;

#[derive(Default)]
pub struct ReferenceBackend {
    state_count: usize,
    pattern_count: usize,
    category_count: usize,
    /// Full partials per buffer, `category × pattern × state`, or `None`
    /// for never-written buffers.
    partials: Vec<Option<Vec<f64>>>,
    /// Compact state codes per tip buffer (code == state count: ambiguous).
    tip_states: Vec<Option<Vec<usize>>>,
    /// Transition matrices, `category × state × state` per buffer.
    matrices: Vec<Vec<f64>>,
    /// Per-pattern log scale factors per buffer.
    scale_factors: Vec<Vec<f64>>,
    pattern_weights: Vec<f64>,
    category_weights: Vec<Vec<f64>>,
    frequencies: Vec<Vec<f64>>,
    site_log_likelihoods: Vec<f64>,
    reset_scale_calls: usize,
    accumulate_scale_calls: usize,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often cumulative scale buffers were reset. Test instrumentation
    /// for the rescaling policies.
    pub fn reset_scale_calls(&self) -> usize {
        self.reset_scale_calls
    }

    /// How often per-node scale factors were accumulated.
    pub fn accumulate_scale_calls(&self) -> usize {
        self.accumulate_scale_calls
    }

    fn source_partials(&self, index: usize, category: usize, pattern: usize) -> SourceRef<'_> {
        if let Some(states) = self.tip_states.get(index).and_then(|s| s.as_ref()) {
            SourceRef::State(states[pattern])
        } else {
            let partials = self.partials[index]
                .as_ref()
                .expect("operation reads an unwritten partials buffer");
            let offset = (category * self.pattern_count + pattern) * self.state_count;
            SourceRef::Vector(&partials[offset..offset + self.state_count])
        }
    }
}

enum SourceRef<'a> {
    /// Compact tip: a single state code, or state count for ambiguous.
    State(usize),
    Vector(&'a [f64]),
}

impl LikelihoodBackend for ReferenceBackend {
    fn allocate(&mut self, request: &AllocationRequest) -> Result<()> {
        if request.state_count == 0 || request.pattern_count == 0 || request.category_count == 0 {
            return Err(Error::BackendUnavailable(
                "empty state, pattern or category dimension".to_string(),
            ));
        }
        if request.partials_buffers < request.tip_count {
            return Err(Error::BackendUnavailable(
                "fewer partials buffers than tip slots".to_string(),
            ));
        }
        self.state_count = request.state_count;
        self.pattern_count = request.pattern_count;
        self.category_count = request.category_count;
        self.partials = (0..request.partials_buffers).map(|_| None).collect();
        self.tip_states = (0..request.partials_buffers).map(|_| None).collect();
        self.matrices = vec![
            vec![0.0; request.category_count * request.state_count * request.state_count];
            request.matrix_buffers
        ];
        self.scale_factors = vec![vec![0.0; request.pattern_count]; request.scale_buffers];
        self.pattern_weights = vec![1.0; request.pattern_count];
        self.category_weights = vec![Vec::new(); request.eigen_buffers];
        self.frequencies = vec![Vec::new(); request.eigen_buffers];
        self.site_log_likelihoods = vec![0.0; request.pattern_count];
        info!(
            patterns = request.pattern_count,
            categories = request.category_count,
            partials_buffers = request.partials_buffers,
            matrix_buffers = request.matrix_buffers,
            scale_buffers = request.scale_buffers,
            "allocated reference likelihood backend"
        );
        Ok(())
    }

    fn set_tip_states(&mut self, index: usize, states: &[usize]) {
        assert_eq!(states.len(), self.pattern_count);
        self.tip_states[index] = Some(states.to_vec());
    }

    fn set_tip_partials(&mut self, index: usize, partials: &[f64]) {
        assert_eq!(
            partials.len(),
            self.category_count * self.pattern_count * self.state_count
        );
        self.partials[index] = Some(partials.to_vec());
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) {
        self.pattern_weights = weights.to_vec();
    }

    fn set_category_rates(&mut self, _rates: &[f64]) {
        // transition matrices arrive fully computed per category, so the
        // raw rates are not consumed here
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) {
        self.category_weights[index] = weights.to_vec();
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) {
        self.frequencies[index] = frequencies.to_vec();
    }

    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]) {
        assert_eq!(
            matrix.len(),
            self.category_count * self.state_count * self.state_count
        );
        self.matrices[index].copy_from_slice(matrix);
    }

    fn update_partials(&mut self, operations: &[PartialsOperation]) {
        let s = self.state_count;
        for op in operations {
            let mut dest =
                vec![0.0; self.category_count * self.pattern_count * s];
            for category in 0..self.category_count {
                let matrix1 = &self.matrices[op.matrix1][category * s * s..(category + 1) * s * s];
                let matrix2 = &self.matrices[op.matrix2][category * s * s..(category + 1) * s * s];
                for pattern in 0..self.pattern_count {
                    let offset = (category * self.pattern_count + pattern) * s;
                    for i in 0..s {
                        let row = i * s;
                        let factor1 = match self.source_partials(op.source1, category, pattern) {
                            SourceRef::State(code) if code < s => matrix1[row + code],
                            SourceRef::State(_) => 1.0,
                            SourceRef::Vector(v) => {
                                (0..s).map(|j| matrix1[row + j] * v[j]).sum()
                            }
                        };
                        let factor2 = match self.source_partials(op.source2, category, pattern) {
                            SourceRef::State(code) if code < s => matrix2[row + code],
                            SourceRef::State(_) => 1.0,
                            SourceRef::Vector(v) => {
                                (0..s).map(|j| matrix2[row + j] * v[j]).sum()
                            }
                        };
                        dest[offset + i] = factor1 * factor2;
                    }
                }
            }

            if let Some(write) = op.write_scale {
                // renormalize each pattern by its maximum and remember the
                // log factor
                for pattern in 0..self.pattern_count {
                    let mut max = 0.0f64;
                    for category in 0..self.category_count {
                        let offset = (category * self.pattern_count + pattern) * s;
                        for i in 0..s {
                            max = max.max(dest[offset + i]);
                        }
                    }
                    if max > 0.0 {
                        for category in 0..self.category_count {
                            let offset = (category * self.pattern_count + pattern) * s;
                            for value in &mut dest[offset..offset + s] {
                                *value /= max;
                            }
                        }
                        self.scale_factors[write][pattern] = max.ln();
                    } else {
                        self.scale_factors[write][pattern] = 0.0;
                    }
                }
            } else if let Some(read) = op.read_scale {
                // coast on cached factors so the accumulated total stays
                // consistent with the stored buffers
                for pattern in 0..self.pattern_count {
                    let factor = (-self.scale_factors[read][pattern]).exp();
                    for category in 0..self.category_count {
                        let offset = (category * self.pattern_count + pattern) * s;
                        for value in &mut dest[offset..offset + s] {
                            *value *= factor;
                        }
                    }
                }
            }

            self.partials[op.destination] = Some(dest);
            self.tip_states[op.destination] = None;
        }
    }

    fn reset_scale_factors(&mut self, index: usize) {
        self.scale_factors[index].fill(0.0);
        self.reset_scale_calls += 1;
    }

    fn accumulate_scale_factors(&mut self, indices: &[usize], destination: usize) {
        for pattern in 0..self.pattern_count {
            let total: f64 = indices
                .iter()
                .map(|&i| self.scale_factors[i][pattern])
                .sum();
            self.scale_factors[destination][pattern] += total;
        }
        self.accumulate_scale_calls += 1;
    }

    fn root_log_likelihood(
        &mut self,
        partials: usize,
        weights: usize,
        frequencies: usize,
        scale: Option<usize>,
    ) -> f64 {
        let root = self.partials[partials]
            .as_ref()
            .expect("root partials buffer was never written");
        let weights = &self.category_weights[weights];
        let frequencies = &self.frequencies[frequencies];
        let s = self.state_count;

        let mut total = 0.0;
        for pattern in 0..self.pattern_count {
            let mut site = 0.0;
            for category in 0..self.category_count {
                let offset = (category * self.pattern_count + pattern) * s;
                let conditional: f64 = (0..s)
                    .map(|i| frequencies[i] * root[offset + i])
                    .sum();
                site += weights[category] * conditional;
            }
            let mut log_site = site.ln();
            if let Some(scale) = scale {
                log_site += self.scale_factors[scale][pattern];
            }
            self.site_log_likelihoods[pattern] = log_site;
            total += log_site * self.pattern_weights[pattern];
        }
        total
    }

    fn site_log_likelihoods(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.site_log_likelihoods);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tips with known states joined by precomputed matrices must give
    /// the hand-computed root likelihood.
    #[test]
    fn single_operation_matches_hand_computation() {
        let mut backend = ReferenceBackend::new();
        backend
            .allocate(&AllocationRequest {
                tip_count: 2,
                partials_buffers: 4,
                compact_buffers: 2,
                state_count: 2,
                pattern_count: 1,
                eigen_buffers: 1,
                matrix_buffers: 2,
                category_count: 1,
                scale_buffers: 1,
                resources: Vec::new(),
            })
            .unwrap();
        backend.set_tip_states(0, &[0]);
        backend.set_tip_states(1, &[1]);
        backend.set_pattern_weights(&[2.0]);
        backend.set_category_weights(0, &[1.0]);
        backend.set_state_frequencies(0, &[0.5, 0.5]);
        let matrix = [0.9, 0.1, 0.1, 0.9];
        backend.set_transition_matrix(0, &matrix);
        backend.set_transition_matrix(1, &matrix);

        backend.update_partials(&[PartialsOperation {
            destination: 2,
            write_scale: None,
            read_scale: None,
            source1: 0,
            matrix1: 0,
            source2: 1,
            matrix2: 1,
        }]);

        // partials: state 0: 0.9 * 0.1, state 1: 0.1 * 0.9
        let expected = (0.5f64 * (0.9 * 0.1) + 0.5 * (0.1 * 0.9)).ln() * 2.0;
        let logl = backend.root_log_likelihood(2, 0, 0, None);
        assert!((logl - expected).abs() < 1e-12);
    }

    /// Scaled and unscaled evaluation agree once the accumulated factors
    /// are added back at the root.
    #[test]
    fn scaling_round_trips_through_accumulation() {
        let mut backend = ReferenceBackend::new();
        backend
            .allocate(&AllocationRequest {
                tip_count: 2,
                partials_buffers: 4,
                compact_buffers: 2,
                state_count: 2,
                pattern_count: 1,
                eigen_buffers: 1,
                matrix_buffers: 2,
                category_count: 1,
                scale_buffers: 3,
                resources: Vec::new(),
            })
            .unwrap();
        backend.set_tip_states(0, &[0]);
        backend.set_tip_states(1, &[0]);
        backend.set_pattern_weights(&[1.0]);
        backend.set_category_weights(0, &[1.0]);
        backend.set_state_frequencies(0, &[0.5, 0.5]);
        let matrix = [0.7, 0.3, 0.3, 0.7];
        backend.set_transition_matrix(0, &matrix);
        backend.set_transition_matrix(1, &matrix);

        let unscaled_op = PartialsOperation {
            destination: 2,
            write_scale: None,
            read_scale: None,
            source1: 0,
            matrix1: 0,
            source2: 1,
            matrix2: 1,
        };
        backend.update_partials(&[unscaled_op]);
        let unscaled = backend.root_log_likelihood(2, 0, 0, None);

        backend.update_partials(&[PartialsOperation {
            destination: 3,
            write_scale: Some(0),
            read_scale: None,
            ..unscaled_op
        }]);
        backend.reset_scale_factors(2);
        backend.accumulate_scale_factors(&[0], 2);
        let scaled = backend.root_log_likelihood(3, 0, 0, Some(2));

        assert!((unscaled - scaled).abs() < 1e-12);
        assert_eq!(backend.reset_scale_calls(), 1);
        assert_eq!(backend.accumulate_scale_calls(), 1);
    }
}
