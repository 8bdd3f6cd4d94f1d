//! Per-run result collection

use crate::work::{ScrapeResult, UnitOutcome};
use std::collections::HashSet;

/// Every unit's outcome for one run, in completion order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    results: Vec<ScrapeResult>,
}

impl RunReport {
    pub fn new(results: Vec<ScrapeResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[ScrapeResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ScrapeResult> {
        self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The result recorded for `unit_id`
    pub fn get(&self, unit_id: &str) -> Option<&ScrapeResult> {
        self.results.iter().find(|result| result.unit_id == unit_id)
    }

    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Failed { .. }))
    }

    pub fn abandoned(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Abandoned { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Skipped))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Interrupted))
    }

    /// Ids of units that ran out of attempts
    pub fn abandoned_ids(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|result| matches!(result.outcome, UnitOutcome::Abandoned { .. }))
            .map(|result| result.unit_id.as_str())
    }

    /// Replaces results for every unit that `later` covers
    pub fn merge(&mut self, later: RunReport) {
        let replaced: HashSet<&str> = later
            .results
            .iter()
            .map(|result| result.unit_id.as_str())
            .collect();
        self.results
            .retain(|result| !replaced.contains(result.unit_id.as_str()));
        self.results.extend(later.results);
    }

    fn count(&self, predicate: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }
}
