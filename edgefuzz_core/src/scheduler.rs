use crate::corpus::Corpus;
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no input can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// A `Scheduler` is responsible for selecting the next input from the `Corpus` to be fuzzed.
pub trait Scheduler {
    /// Selects the next input to mutate.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to select from. It is only read.
    /// * `rng`: The random source driving the selection.
    ///
    /// # Returns
    /// The ID of the selected input, or `SchedulerError::CorpusEmpty` when
    /// there is nothing to select.
    fn next(
        &mut self,
        corpus: &dyn Corpus,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError>;

    /// Tells the scheduler that mutating `input_id` produced a retained candidate.
    fn report_discovery(&mut self, _input_id: usize, _new_edges: usize) {}
}

/// Picks every corpus entry with equal probability.
///
/// There is deliberately no favouring of entries that cover rare edges.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl Scheduler for RandomScheduler {
    fn next(
        &mut self,
        corpus: &dyn Corpus,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        Ok(rng.random_range(0..corpus.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::input::TestCase;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn random_scheduler_next_from_empty_corpus_returns_corpus_empty_error() {
        let mut scheduler = RandomScheduler::new();
        let corpus = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);

        match scheduler.next(&corpus, &mut rng) {
            Err(SchedulerError::CorpusEmpty) => {}
            Ok(id) => panic!("Expected an error from an empty corpus, got id {id}"),
        }
    }

    #[test]
    fn random_scheduler_covers_corpus_uniformly() {
        let mut scheduler = RandomScheduler::new();
        let mut corpus = InMemoryCorpus::new();
        for byte in 0u8..4 {
            corpus.add(TestCase::new(vec![byte]).unwrap());
        }
        let mut rng = ChaCha8Rng::from_seed([1; 32]);

        let draws = 8000;
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..draws {
            let id = scheduler.next(&corpus, &mut rng).unwrap();
            assert!(id < corpus.len());
            *counts.entry(id).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            let share = *count as f64 / draws as f64;
            assert!((share - 0.25).abs() < 0.03, "share {share}");
        }
    }

    #[test]
    fn same_seed_selects_same_sequence() {
        let mut corpus = InMemoryCorpus::new();
        for byte in 0u8..10 {
            corpus.add(TestCase::new(vec![byte]).unwrap());
        }
        let picks = |seed: u8| {
            let mut scheduler = RandomScheduler::new();
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            (0..32)
                .map(|_| scheduler.next(&corpus, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(3), picks(3));
    }

    #[test]
    fn report_discovery_is_a_noop() {
        let mut scheduler = RandomScheduler::new();
        scheduler.report_discovery(0, 3);
    }
}
