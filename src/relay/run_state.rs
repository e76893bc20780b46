use std::collections::{HashMap, HashSet};

use crate::config::RunConfig;

/// Immutable view of one run, swapped in whole by `Relay::start_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub bruise_tolerance: usize,
    pub max_bruises: usize,
    expected: HashMap<usize, HashSet<String>>,
}

impl RunState {
    pub fn from_config(config: &RunConfig) -> Self {
        let mut expected: HashMap<usize, HashSet<String>> = HashMap::new();
        for entry in &config.expected {
            expected
                .entry(entry.layer)
                .or_default()
                .insert(entry.nonce.clone());
        }
        Self {
            run_id: config.run_id.clone(),
            bruise_tolerance: config.bruise_tolerance,
            max_bruises: config.max_bruises(),
            expected,
        }
    }

    pub fn expects(&self, layer: usize, nonce: &str) -> bool {
        self.expected
            .get(&layer)
            .is_some_and(|nonces| nonces.contains(nonce))
    }

    pub fn expected_count(&self) -> usize {
        self.expected.values().map(HashSet::len).sum()
    }
}
