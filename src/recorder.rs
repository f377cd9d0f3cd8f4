//! Invocation recording.
//!
//! A [`Recorder`] is handed to the orchestrator and told about every
//! fixture instantiation, method invocation and suite lifecycle call. It
//! exists so callers can verify what actually ran (how many attempts a
//! flaky test took, which methods a shard touched) without the test
//! bodies keeping global registries of their own.
//!
//! [`InvocationLog`] is an append-only, resettable recorder;
//! [`NullRecorder`] discards everything.

use std::sync::Mutex;

use crate::catalog::TestId;

/// Something the orchestrator did on behalf of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationEvent {
    /// A fresh fixture was requested for an attempt.
    Instantiated { id: TestId, attempt: usize },
    /// A method was invoked on a fixture.
    Invoked { id: TestId, attempt: usize },
    SuiteSetup { suite: String },
    SuiteTeardown { suite: String },
}

/// Receives invocation events from worker threads.
pub trait Recorder: Send + Sync {
    fn record(&self, event: InvocationEvent);
}

/// Discards all events.
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&self, _event: InvocationEvent) {}
}

/// Append-only event log with an explicit reset.
#[derive(Debug, Default)]
pub struct InvocationLog {
    events: Mutex<Vec<InvocationEvent>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the log, e.g. between runs.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Returns a copy of every event in arrival order.
    pub fn events(&self) -> Vec<InvocationEvent> {
        self.lock().clone()
    }

    /// Number of fixtures instantiated for `id`.
    pub fn instantiations(&self, id: &TestId) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, InvocationEvent::Instantiated { id: i, .. } if i == id))
            .count()
    }

    /// Number of times `id` was invoked.
    pub fn invocations(&self, id: &TestId) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, InvocationEvent::Invoked { id: i, .. } if i == id))
            .count()
    }

    /// Total fixture instantiations across all tests.
    pub fn total_instantiations(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, InvocationEvent::Instantiated { .. }))
            .count()
    }

    /// Names of invoked methods, one entry per invocation, sorted.
    ///
    /// Sorting makes the listing independent of completion order.
    pub fn called_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter_map(|e| match e {
                InvocationEvent::Invoked { id, .. } => Some(id.name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Suites whose setup ran, in arrival order.
    pub fn suites_set_up(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                InvocationEvent::SuiteSetup { suite } => Some(suite.clone()),
                _ => None,
            })
            .collect()
    }

    /// Suites whose teardown ran, in arrival order.
    pub fn suites_torn_down(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                InvocationEvent::SuiteTeardown { suite } => Some(suite.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<InvocationEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Recorder for InvocationLog {
    fn record(&self, event: InvocationEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_reset() {
        let log = InvocationLog::new();
        let id = TestId::new("FlakyTest", "flaky1");
        for attempt in 0..2 {
            log.record(InvocationEvent::Instantiated {
                id: id.clone(),
                attempt,
            });
            log.record(InvocationEvent::Invoked {
                id: id.clone(),
                attempt,
            });
        }
        log.record(InvocationEvent::SuiteSetup {
            suite: "FlakyTest".into(),
        });

        assert_eq!(log.instantiations(&id), 2);
        assert_eq!(log.invocations(&id), 2);
        assert_eq!(log.total_instantiations(), 2);
        assert_eq!(log.called_methods(), vec!["flaky1", "flaky1"]);
        assert_eq!(log.suites_set_up(), vec!["FlakyTest"]);

        log.reset();
        assert!(log.events().is_empty());
    }
}
