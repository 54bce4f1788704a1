use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;

use tracing::{error, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Attempt counts per item, kept for the lifetime of one batch.
#[derive(Debug, Clone)]
pub struct RetryLedger<K> {
    attempts: HashMap<K, u32>,
}

impl<K: Eq + Hash> RetryLedger<K> {
    pub fn new() -> Self {
        Self {
            attempts: HashMap::new(),
        }
    }

    /// Counts a new attempt for `item` and returns the running total.
    pub fn begin(&mut self, item: K) -> u32 {
        let count = self.attempts.entry(item).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, item: &K) -> u32 {
        self.attempts.get(item).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash> Default for RetryLedger<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned<T> {
    pub item: T,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug)]
pub struct RetryOutcome<T, R> {
    pub results: Vec<R>,
    pub abandoned: Vec<Abandoned<T>>,
    /// Attempts per input position, so equal items are counted apart.
    pub ledger: RetryLedger<usize>,
}

/// Runs `action` over every item, re-running the failures in later passes
/// until each item succeeds or has failed `max_attempts` times.
///
/// Items are processed one at a time, in input order within a pass.
pub async fn complete_with_retries<T, R, E, F, Fut>(
    items: Vec<T>,
    mut action: F,
    max_attempts: u32,
) -> RetryOutcome<T, R>
where
    T: Clone + Display,
    E: Display,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut ledger = RetryLedger::new();
    let mut results = Vec::new();
    let mut abandoned = Vec::new();
    let mut pending: Vec<(usize, T)> = items.into_iter().enumerate().collect();

    while !pending.is_empty() {
        let mut failed = Vec::new();
        for (index, item) in pending {
            let attempt = ledger.begin(index);
            match action(item.clone()).await {
                Ok(result) => results.push(result),
                Err(err) if attempt < max_attempts => {
                    warn!(
                        item = %item,
                        attempt,
                        max_attempts,
                        error = %err,
                        "item failed; will retry"
                    );
                    failed.push((index, item));
                }
                Err(err) => {
                    error!(
                        item = %item,
                        attempts = attempt,
                        error = %err,
                        "item failed on its last attempt; giving up"
                    );
                    abandoned.push(Abandoned {
                        item,
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
            }
        }
        pending = failed;
    }

    RetryOutcome {
        results,
        abandoned,
        ledger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    async fn run_flaky(
        items: Vec<&'static str>,
        failures: &Mutex<HashMap<&'static str, u32>>,
        calls: &Mutex<Vec<&'static str>>,
        max_attempts: u32,
    ) -> RetryOutcome<&'static str, &'static str> {
        complete_with_retries(
            items,
            |item| {
                calls.lock().unwrap().push(item);
                let mut left = failures.lock().unwrap();
                let result = match left.get_mut(item) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        Err(format!("{item} is unavailable"))
                    }
                    _ => Ok(item),
                };
                async move { result }
            },
            max_attempts,
        )
        .await
    }

    #[tokio::test]
    async fn healthy_items_run_once() {
        let failures = Mutex::new(HashMap::new());
        let calls = Mutex::new(Vec::new());
        let outcome = run_flaky(vec!["a", "b", "c"], &failures, &calls, 3).await;

        assert_eq!(outcome.results, vec!["a", "b", "c"]);
        assert!(outcome.abandoned.is_empty());
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_in_a_later_pass() {
        let failures = Mutex::new(HashMap::from([("b", 1)]));
        let calls = Mutex::new(Vec::new());
        let outcome = run_flaky(vec!["a", "b", "c"], &failures, &calls, 3).await;

        assert_eq!(outcome.results, vec!["a", "c", "b"]);
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c", "b"]);
        assert_eq!(outcome.ledger.attempts(&1), 2);
        assert_eq!(outcome.ledger.attempts(&0), 1);
    }

    #[tokio::test]
    async fn persistent_failure_is_abandoned_at_the_ceiling() {
        let failures = Mutex::new(HashMap::from([("bad", u32::MAX)]));
        let calls = Mutex::new(Vec::new());
        let outcome = run_flaky(vec!["bad", "good"], &failures, &calls, 3).await;

        assert_eq!(outcome.results, vec!["good"]);
        assert_eq!(outcome.abandoned.len(), 1);
        assert_eq!(outcome.abandoned[0].item, "bad");
        assert_eq!(outcome.abandoned[0].attempts, 3);
        assert_eq!(outcome.abandoned[0].last_error, "bad is unavailable");
        let bad_calls = calls.lock().unwrap().iter().filter(|c| **c == "bad").count();
        assert_eq!(bad_calls, 3);
    }

    #[tokio::test]
    async fn duplicate_items_get_their_own_attempts() {
        let failures = Mutex::new(HashMap::from([("dup", u32::MAX)]));
        let calls = Mutex::new(Vec::new());
        let outcome = run_flaky(vec!["dup", "dup"], &failures, &calls, 3).await;

        assert_eq!(calls.lock().unwrap().len(), 6);
        assert_eq!(outcome.abandoned.len(), 2);
        assert!(outcome.abandoned.iter().all(|a| a.attempts == 3));
        assert_eq!(outcome.ledger.attempts(&0), 3);
        assert_eq!(outcome.ledger.attempts(&1), 3);
    }

    #[tokio::test]
    async fn zero_ceiling_still_attempts_once() {
        let failures = Mutex::new(HashMap::from([("a", 1)]));
        let calls = Mutex::new(Vec::new());
        let outcome = run_flaky(vec!["a"], &failures, &calls, 0).await;

        assert_eq!(outcome.abandoned.len(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerunning_a_finished_batch_copies_nothing_twice() {
        let copied = Mutex::new(HashSet::new());
        let uploads = Mutex::new(0u32);
        let copy = |item: &'static str| {
            let fresh = copied.lock().unwrap().insert(item);
            if fresh {
                *uploads.lock().unwrap() += 1;
            }
            async move { Ok::<_, String>(item) }
        };

        let first = complete_with_retries(vec!["a", "b"], copy, 3).await;
        let second = complete_with_retries(vec!["a", "b"], copy, 3).await;

        assert_eq!(first.results.len(), 2);
        assert_eq!(second.results.len(), 2);
        assert_eq!(*uploads.lock().unwrap(), 2);
    }
}
