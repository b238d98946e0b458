use crate::tree::HaploId;

/// Per-haplotype bookkeeping of duplicate samples: the latent heights at
/// which duplicate lineages rejoin the haplotype's main branch, the distinct
/// sampling heights, and how many duplicates were sampled at each of them.
///
/// Invariants maintained outside transient construction:
/// - `attachment_times` slot 0 holds the lineage-start height, which is the
///   maximum of the list; the remaining entries are sorted ascending.
/// - `tip_times` is sorted ascending (most recent sample first, since height
///   zero is the present) and `tip_counts` runs parallel to it.
/// - the attachment list length equals the total duplicate count.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentLedger {
    attachment_times: Vec<f64>,
    tip_times: Vec<f64>,
    tip_counts: Vec<usize>,
    parent_haplo: Option<HaploId>,
}

impl AttachmentLedger {
    /// Ledger for a freshly discovered haplotype: `duplicates` zeroed
    /// attachment slots (filled in during collapsing), one sampling time
    /// entry with the given count.
    pub(crate) fn new(duplicates: usize, tip_time: f64, count: usize) -> Self {
        Self {
            attachment_times: vec![0.0; duplicates],
            tip_times: vec![tip_time],
            tip_counts: vec![count],
            parent_haplo: None,
        }
    }

    /// Ledger restored from serialized metadata; the attachment list is
    /// taken verbatim (the explicit first-attachment height is preserved).
    pub(crate) fn from_parts(
        attachment_times: Vec<f64>,
        tip_times: Vec<f64>,
        tip_counts: Vec<usize>,
    ) -> Self {
        Self {
            attachment_times,
            tip_times,
            tip_counts,
            parent_haplo: None,
        }
    }

    pub fn attachment_times(&self) -> &[f64] {
        &self.attachment_times
    }

    pub fn tip_times(&self) -> &[f64] {
        &self.tip_times
    }

    pub fn tip_counts(&self) -> &[usize] {
        &self.tip_counts
    }

    pub fn parent_haplo(&self) -> Option<HaploId> {
        self.parent_haplo
    }

    pub(crate) fn set_parent_haplo(&mut self, parent: Option<HaploId>) {
        self.parent_haplo = parent;
    }

    /// Total number of samples folded into this tip.
    pub fn total_count(&self) -> usize {
        self.tip_counts.iter().sum()
    }

    /// The lineage-start height of the haplotype.
    pub fn lineage_start(&self) -> f64 {
        self.attachment_times[0]
    }

    /// Record a duplicate join height observed during collapsing, consuming
    /// the first remaining placeholder slot.
    pub(crate) fn record_attachment(&mut self, height: f64) {
        let slot = self
            .attachment_times
            .iter()
            .position(|&t| t == 0.0)
            .expect("attachment list has no free slot left");
        self.attachment_times[slot] = height;
    }

    /// Append a sampling-time entry, or report the existing entry at the
    /// same height. Returns `false` if the height is already present.
    pub(crate) fn push_tip_time(&mut self, height: f64, count: usize) -> bool {
        if self.tip_times.contains(&height) {
            return false;
        }
        self.tip_times.push(height);
        self.tip_counts.push(count);
        true
    }

    /// Increment the duplicate count for an existing sampling height, or
    /// append a new entry with count one.
    pub(crate) fn bump_tip_time(&mut self, height: f64) {
        if let Some(i) = self.tip_times.iter().position(|&t| t == height) {
            self.tip_counts[i] += 1;
        } else {
            self.tip_times.push(height);
            self.tip_counts.push(1);
        }
    }

    /// Synthesize the k−1 latent attachment heights for k duplicate events
    /// from the sampling-time blocks, evenly subdividing the interval
    /// between the enclosing-lineage height and each sampling time. One
    /// placeholder slot is left at zero and becomes the lineage-start height
    /// on the subsequent sort.
    ///
    /// `enclosing` is the height of the nearest non-continuing ancestor (the
    /// parent of the tip in the collapsed tree), or the origin for a
    /// single-tip tree.
    pub(crate) fn synthesize_attachment_times(&mut self, enclosing: f64) {
        debug_assert!(!self.tip_times.is_empty());
        let total = self.total_count();
        self.attachment_times.clear();
        self.attachment_times.resize(total, 0.0);

        let mut slot = 0;
        for (block, (&time, &count)) in self.tip_times.iter().zip(self.tip_counts.iter()).enumerate()
        {
            let interval = (enclosing - time) / (1.0 + count as f64);
            // the first block spends one of its events on the tip itself
            let start = if block == 0 { 1 } else { 0 };
            for j in start..count {
                self.attachment_times[slot] = enclosing - (j + 1) as f64 * interval;
                slot += 1;
            }
        }
        debug_assert_eq!(slot + 1, total.max(1));
        self.set_first_entry_and_sort();
    }

    /// Ascending sort, then swap the first and last entries so slot 0 holds
    /// the maximum. Preserves the multiset; used after deserialization where
    /// the lineage-start height arrives as an explicit value.
    pub(crate) fn sort_attachment_times(&mut self) {
        self.attachment_times
            .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
        let len = self.attachment_times.len();
        if len > 1 {
            self.attachment_times.swap(0, len - 1);
        }
    }

    /// Ascending sort, then overwrite slot 0 with the maximum. Consumes the
    /// zero placeholder left by collapsing or synthesis: afterwards slot 0
    /// marks the lineage start at the topmost attachment height. A haplotype
    /// with a single sample starts at its sampling height.
    pub(crate) fn set_first_entry_and_sort(&mut self) {
        self.attachment_times
            .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
        let len = self.attachment_times.len();
        if len > 1 {
            self.attachment_times[0] = self.attachment_times[len - 1];
        } else if len == 1 {
            self.attachment_times[0] = self
                .tip_times
                .iter()
                .cloned()
                .fold(f64::INFINITY, f64::min);
        }
    }

    /// Co-sort sampling times and counts ascending by height.
    pub(crate) fn sort_tip_times(&mut self) {
        let mut order: Vec<usize> = (0..self.tip_times.len()).collect();
        order.sort_unstable_by(|&a, &b| self.tip_times[a].partial_cmp(&self.tip_times[b]).unwrap());
        self.tip_times = order.iter().map(|&i| self.tip_times[i]).collect();
        self.tip_counts = order.iter().map(|&i| self.tip_counts[i]).collect();
    }

    /// Number of sampled lineages entering the height window `[low, high)`:
    /// the sum of duplicate counts over sampling-time entries inside the
    /// window. Consumed by proposal mechanisms, not by the likelihood.
    pub fn count_possible_attachment_branches(&self, low: f64, high: f64) -> usize {
        self.tip_times
            .iter()
            .zip(self.tip_counts.iter())
            .filter(|(&t, _)| low <= t && t < high)
            .map(|(_, &c)| c)
            .sum()
    }

    /// Total branch length over which the haplotype persists without
    /// evolving: every duplicate lineage runs from its attachment height
    /// down to its sampling height.
    pub fn total_branch_length(&self) -> f64 {
        let attached: f64 = self.attachment_times.iter().sum();
        let sampled: f64 = self
            .tip_times
            .iter()
            .zip(self.tip_counts.iter())
            .map(|(&t, &c)| t * c as f64)
            .sum();
        attached - sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesis_produces_total_count_entries_below_enclosing() {
        let mut ledger = AttachmentLedger::new(0, 0.0, 3);
        ledger.push_tip_time(1.0, 2);
        ledger.synthesize_attachment_times(4.0);

        assert_eq!(ledger.attachment_times().len(), 5);
        // slot 0 carries the maximum
        let max = ledger
            .attachment_times()
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max);
        assert_eq!(ledger.lineage_start(), max);
        assert!(ledger.attachment_times().iter().all(|&t| t < 4.0 && t > 0.0));
    }

    #[test]
    fn deserialized_sort_preserves_multiset() {
        let mut ledger =
            AttachmentLedger::from_parts(vec![5.0, 1.0, 3.0, 5.0], vec![0.0], vec![4]);
        ledger.sort_attachment_times();
        assert_eq!(ledger.lineage_start(), 5.0);
        let mut sorted = ledger.attachment_times().to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, vec![1.0, 3.0, 5.0, 5.0]);
    }

    #[test]
    fn window_counting_sums_duplicate_counts() {
        let mut ledger = AttachmentLedger::new(0, 0.0, 2);
        ledger.push_tip_time(1.5, 3);
        ledger.push_tip_time(4.0, 1);
        assert_eq!(ledger.count_possible_attachment_branches(0.0, 2.0), 5);
        assert_eq!(ledger.count_possible_attachment_branches(1.0, 5.0), 4);
        assert_eq!(ledger.count_possible_attachment_branches(5.0, 9.0), 0);
    }

    #[test]
    fn total_branch_length_spans_all_duplicate_lineages() {
        // two samples at height 0, attachments at 2.0 (start) and 1.0
        let mut ledger = AttachmentLedger::from_parts(vec![2.0, 1.0], vec![0.0], vec![2]);
        ledger.sort_attachment_times();
        assert!((ledger.total_branch_length() - 3.0).abs() < 1e-12);
    }
}
