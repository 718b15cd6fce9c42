//! Per-query results shared by every analysis of a run.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use smol_str::SmolStr;
use verisym_parse::ast::{Query, QueryKind};

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub query: Query<SmolStr>,
    /// An attack was found.
    pub resolved: bool,
    pub summary: String,
    pub options: Vec<QueryOptionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptionResult {
    pub option: String,
    pub resolved: bool,
    pub summary: String,
}

impl VerifyResult {
    pub fn code(&self) -> String {
        let kind = match self.query.kind {
            QueryKind::Confidentiality => 'c',
            QueryKind::Authentication => 'a',
            QueryKind::Freshness => 'f',
            QueryKind::Unlinkability => 'u',
        };
        format!("{}{}", kind, if self.resolved { 1 } else { 0 })
    }
}

/// First writer wins: once a query is resolved, later writes for it are dropped.
#[derive(Debug)]
pub struct Results {
    results: RwLock<Vec<VerifyResult>>,
    unresolved: AtomicUsize,
}

impl Results {
    pub fn new(queries: &[Query<SmolStr>]) -> Self {
        let results = queries
            .iter()
            .map(|query| VerifyResult {
                query: query.clone(),
                resolved: false,
                summary: String::new(),
                options: Vec::new(),
            })
            .collect::<Vec<_>>();
        Results {
            unresolved: AtomicUsize::new(results.len()),
            results: RwLock::new(results),
        }
    }

    pub fn read(&self) -> Vec<VerifyResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_resolved(&self, index: usize) -> bool {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map_or(true, |r| r.resolved)
    }

    /// Returns whether the write took effect.
    pub fn put_write(&self, index: usize, result: VerifyResult) -> bool {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        let slot = match results.get_mut(index) {
            Some(slot) if !slot.resolved => slot,
            _ => return false,
        };
        if result.resolved {
            self.unresolved.fetch_sub(1, Ordering::SeqCst);
        }
        *slot = result;
        true
    }

    pub fn all_resolved(&self) -> bool {
        self.unresolved.load(Ordering::SeqCst) == 0
    }

    pub fn code(&self) -> String {
        self.read().iter().map(VerifyResult::code).collect()
    }
}

/// Completed analyses, for progress reporting.
#[derive(Debug, Default)]
pub struct AnalysisCounter(AtomicU32);

impl AnalysisCounter {
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Whether analysis number `n` should be reported.
    pub fn should_report(n: u32) -> bool {
        match n {
            n if n > 100_000 => n % 500 == 0,
            n if n > 10_000 => n % 100 == 0,
            n if n > 1_000 => n % 50 == 0,
            n if n > 100 => n % 10 == 0,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    fn queries(src: &str) -> Vec<Query<SmolStr>> {
        verisym_parse::parse_model(src).unwrap().queries
    }

    fn attacked(query: &Query<SmolStr>, summary: &str) -> VerifyResult {
        VerifyResult {
            query: query.clone(),
            resolved: true,
            summary: summary.to_string(),
            options: Vec::new(),
        }
    }

    #[test]
    fn first_writer_wins() {
        let queries = queries(
            "attacker[passive] principal A[ knows private x, y ] queries[ confidentiality? x freshness? y ]",
        );
        let results = Results::new(&queries);
        assert!(!results.all_resolved());
        assert_eq!(results.code(), "c0f0");

        let written = (0..64)
            .into_par_iter()
            .filter(|i| results.put_write(0, attacked(&queries[0], &i.to_string())))
            .count();
        assert_eq!(written, 1);
        assert!(results.is_resolved(0));
        assert!(!results.all_resolved());

        assert!(results.put_write(1, attacked(&queries[1], "stale")));
        assert!(results.all_resolved());
        assert_eq!(results.code(), "c1f1");
        assert!(!results.put_write(7, attacked(&queries[1], "out of range")));
    }

    #[test]
    fn progress_is_throttled() {
        assert!(AnalysisCounter::should_report(7));
        assert!(!AnalysisCounter::should_report(105));
        assert!(AnalysisCounter::should_report(110));
        assert!(!AnalysisCounter::should_report(1_010));
        assert!(AnalysisCounter::should_report(1_050));
        assert!(AnalysisCounter::should_report(100_500));
        assert!(!AnalysisCounter::should_report(100_100));

        let counter = AnalysisCounter::default();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.get(), 1);
    }
}
