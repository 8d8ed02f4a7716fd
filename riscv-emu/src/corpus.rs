//! Shared corpus of fuzzing inputs plus the global coverage bitmap.
//!
//! Many worker threads read from and occasionally add to the corpus
//! concurrently (spec.md §5). The synchronization discipline is a single
//! mutex guarding both the input list and the coverage bitmap, held only
//! long enough to append an input and OR in newly discovered edges — never
//! while a guest case is executing.

use std::sync::Mutex;

use xorshift::Xorshift64;

use crate::coverage::Coverage;

struct Inner {
    inputs: Vec<Vec<u8>>,
    coverage: std::collections::HashSet<u64>,
}

/// Shared, thread-safe corpus of inputs and aggregate coverage.
pub struct Corpus {
    inner: Mutex<Inner>,
}

impl Corpus {
    /// Creates an empty corpus.
    pub fn new() -> Corpus {
        Corpus {
            inner: Mutex::new(Inner {
                inputs: Vec::new(),
                coverage: std::collections::HashSet::new(),
            }),
        }
    }

    /// Unconditionally adds a seed input, used at startup before any
    /// coverage has been collected.
    pub fn add_seed(&self, input: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.inputs.push(input);
    }

    /// Merges a worker's locally-observed edges into the shared bitmap.
    /// Returns `true` if at least one edge was new process-wide. Coverage
    /// bits only ever flip 0→1, so this is safe to call from any number of
    /// workers in any order (spec.md §5 "ordering").
    pub fn merge_coverage(&self, local: &Coverage) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut found_new = false;
        for &edge in local.edge_ids() {
            if inner.coverage.insert(edge) {
                found_new = true;
            }
        }
        found_new
    }

    /// Adds `input` to the corpus if merging `local`'s coverage discovered
    /// anything new process-wide. Returns whether the input was kept.
    pub fn promote_if_new_coverage(&self, input: Vec<u8>, local: &Coverage) -> bool {
        if self.merge_coverage(local) {
            let mut inner = self.inner.lock().unwrap();
            inner.inputs.push(input);
            true
        } else {
            false
        }
    }

    /// Number of inputs currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of distinct edges observed across every worker.
    pub fn coverage_len(&self) -> usize {
        self.inner.lock().unwrap().coverage.len()
    }

    /// Clones a uniformly random input from the corpus, or `None` if empty.
    pub fn pick(&self, rng: &mut Xorshift64) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        if inner.inputs.is_empty() {
            return None;
        }
        let idx = rng.next_below(inner.inputs.len());
        Some(inner.inputs[idx].clone())
    }
}

impl Default for Corpus {
    fn default() -> Corpus {
        Corpus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_input_is_retrievable() {
        let corpus = Corpus::new();
        corpus.add_seed(vec![1, 2, 3]);
        assert_eq!(corpus.len(), 1);

        let mut rng = Xorshift64::new(1);
        assert_eq!(corpus.pick(&mut rng), Some(vec![1, 2, 3]));
    }

    #[test]
    fn merge_coverage_reports_new_edges_once() {
        let corpus = Corpus::new();
        let mut local = Coverage::new();
        local.record(0x1000, 0x1004);

        assert!(corpus.merge_coverage(&local));
        assert!(!corpus.merge_coverage(&local));
        assert_eq!(corpus.coverage_len(), 1);
    }

    #[test]
    fn promote_only_keeps_inputs_with_new_coverage() {
        let corpus = Corpus::new();

        let mut first = Coverage::new();
        first.record(0x1000, 0x1004);
        assert!(corpus.promote_if_new_coverage(vec![0xaa], &first));

        // Same edges again: nothing new, input dropped.
        let mut repeat = Coverage::new();
        repeat.record(0x1000, 0x1004);
        assert!(!corpus.promote_if_new_coverage(vec![0xbb], &repeat));

        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn pick_from_empty_corpus_is_none() {
        let corpus = Corpus::new();
        let mut rng = Xorshift64::new(1);
        assert_eq!(corpus.pick(&mut rng), None);
    }
}
