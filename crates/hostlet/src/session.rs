//! Parent-side aggregation of streamed discovery and execution results.
//!
//! The channel delivers results in batches, out of any particular order
//! relative to handler completion; these trackers collect them and signal
//! completion so a front-end can wait instead of polling.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::bridge::protocol::{
    DiscoveredTests, TestCaseInfo, TestOutcome, TestResultBatch, TestResultInfo,
};

/// Collects per-source discovery results until every requested source has
/// reported.
pub struct DiscoveryTracker {
    per_source: DashMap<String, Vec<TestCaseInfo>>,
    expected_sources: usize,
    reported: AtomicUsize,
    completion: Notify,
}

impl DiscoveryTracker {
    pub fn new(expected_sources: usize) -> Self {
        Self {
            per_source: DashMap::new(),
            expected_sources,
            reported: AtomicUsize::new(0),
            completion: Notify::new(),
        }
    }

    pub fn record(&self, discovered: DiscoveredTests) {
        let first_report = self
            .per_source
            .insert(discovered.source.clone(), discovered.tests)
            .is_none();
        if first_report {
            let reported = self.reported.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                source = %discovered.source,
                reported,
                expected = self.expected_sources,
                "discovery result recorded"
            );
            if reported >= self.expected_sources {
                self.completion.notify_waiters();
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.reported.load(Ordering::SeqCst) >= self.expected_sources
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.completion.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub fn tests_for(&self, source: &str) -> Option<Vec<TestCaseInfo>> {
        self.per_source.get(source).map(|entry| entry.clone())
    }

    pub fn sources(&self) -> Vec<String> {
        self.per_source
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Total discovered test cases across all sources so far.
    pub fn total(&self) -> usize {
        self.per_source.iter().map(|entry| entry.len()).sum()
    }
}

/// Outcome counts for one execution run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub setup_failed: usize,
    pub cleanup_failed: usize,
}

impl OutcomeTally {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.setup_failed + self.cleanup_failed
    }
}

struct ExecutionProgress {
    expected: Option<usize>,
    results: Vec<TestResultInfo>,
}

/// Collects streamed execution result batches until the announced case count
/// has been reached.
pub struct ExecutionTracker {
    progress: StdMutex<ExecutionProgress>,
    completion: Notify,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            progress: StdMutex::new(ExecutionProgress {
                expected: None,
                results: Vec::new(),
            }),
            completion: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExecutionProgress> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the announced total; completion may already be satisfied by
    /// batches that arrived first.
    pub fn record_count(&self, count: u32) {
        let complete = {
            let mut progress = self.lock();
            progress.expected = Some(count as usize);
            progress.results.len() >= count as usize
        };
        tracing::debug!(count, "expected result count recorded");
        if complete {
            self.completion.notify_waiters();
        }
    }

    pub fn record_batch(&self, batch: TestResultBatch) {
        let complete = {
            let mut progress = self.lock();
            progress.results.extend(batch.results);
            matches!(progress.expected, Some(expected) if progress.results.len() >= expected)
        };
        if complete {
            self.completion.notify_waiters();
        }
    }

    pub fn is_complete(&self) -> bool {
        let progress = self.lock();
        matches!(progress.expected, Some(expected) if progress.results.len() >= expected)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.completion.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub fn results(&self) -> Vec<TestResultInfo> {
        self.lock().results.clone()
    }

    pub fn tally(&self) -> OutcomeTally {
        let progress = self.lock();
        let mut tally = OutcomeTally::default();
        for result in &progress.results {
            match &result.outcome {
                TestOutcome::Passed => tally.passed += 1,
                TestOutcome::Failed { .. } => tally.failed += 1,
                TestOutcome::Skipped { .. } => tally.skipped += 1,
                TestOutcome::SetupFailed { .. } => tally.setup_failed += 1,
                TestOutcome::CleanupFailed { .. } => tally.cleanup_failed += 1,
            }
        }
        tally
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn case(name: &str) -> TestCaseInfo {
        TestCaseInfo {
            fully_qualified_name: name.to_string(),
            display_name: name.to_string(),
            source_file: None,
            line: None,
            categories: Vec::new(),
        }
    }

    fn result(name: &str, outcome: TestOutcome) -> TestResultInfo {
        TestResultInfo {
            display_name: name.to_string(),
            outcome,
            duration_millis: 5,
            device_name: "virtual-0".to_string(),
            output: Vec::new(),
        }
    }

    #[tokio::test]
    async fn discovery_completes_after_all_sources_report() {
        let tracker = Arc::new(DiscoveryTracker::new(2));

        tracker.record(DiscoveredTests {
            source: "a.bin".to_string(),
            tests: vec![case("a::one")],
        });
        assert!(!tracker.is_complete());

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait().await })
        };

        tracker.record(DiscoveredTests {
            source: "b.bin".to_string(),
            tests: vec![case("b::one"), case("b::two")],
        });

        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(tracker.is_complete());
        assert_eq!(tracker.total(), 3);
        assert_eq!(tracker.tests_for("b.bin").unwrap().len(), 2);
        let mut sources = tracker.sources();
        sources.sort();
        assert_eq!(sources, vec!["a.bin".to_string(), "b.bin".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_source_report_replaces_without_double_count() {
        let tracker = DiscoveryTracker::new(1);
        tracker.record(DiscoveredTests {
            source: "a.bin".to_string(),
            tests: vec![case("a::one")],
        });
        tracker.record(DiscoveredTests {
            source: "a.bin".to_string(),
            tests: vec![case("a::one"), case("a::two")],
        });
        assert!(tracker.is_complete());
        assert_eq!(tracker.total(), 2);
    }

    #[tokio::test]
    async fn execution_completes_when_count_is_reached() {
        let tracker = ExecutionTracker::new();
        tracker.record_count(2);
        tracker.record_batch(TestResultBatch {
            results: vec![result("one", TestOutcome::Passed)],
        });
        assert!(!tracker.is_complete());

        tracker.record_batch(TestResultBatch {
            results: vec![result(
                "two",
                TestOutcome::Failed {
                    message: "assertion".to_string(),
                },
            )],
        });
        assert!(tracker.is_complete());
        timeout(Duration::from_secs(1), tracker.wait()).await.unwrap();

        let tally = tracker.tally();
        assert_eq!(tally.passed, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.total(), 2);
    }

    #[tokio::test]
    async fn late_count_still_completes() {
        let tracker = ExecutionTracker::new();
        tracker.record_batch(TestResultBatch {
            results: vec![
                result("one", TestOutcome::Passed),
                result(
                    "two",
                    TestOutcome::Skipped {
                        reason: "cancelled".to_string(),
                    },
                ),
            ],
        });
        assert!(!tracker.is_complete());

        tracker.record_count(2);
        assert!(tracker.is_complete());
        assert_eq!(tracker.tally().skipped, 1);
    }
}
