#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples in this workspace.

use std::env;
use std::panic;
use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Runs a test on a separate thread and fails it if it does not complete in time.
///
/// Concurrency tests that deadlock would otherwise hang the whole test run. The timeout is
/// 10 seconds under normal conditions and 60 seconds under Miri, where thread synchronization
/// is much slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly, so that mutation testing can detect mutations
/// that cause hangs.
///
/// # Panics
///
/// Panics if the test exceeds the timeout. A panic in the test itself is resumed on the
/// calling thread.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {} second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Runs `f` on `threads` threads at once, releasing them together from a barrier to maximize
/// the chance that they contend with each other.
///
/// Each thread receives its index in `0..threads`. Returns the results ordered by index.
///
/// # Panics
///
/// Panics if any thread panics.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::race;
///
/// let counter = AtomicUsize::new(0);
///
/// let results = race(4, |index| {
///     counter.fetch_add(1, Ordering::Relaxed);
///     index * 10
/// });
///
/// assert_eq!(results, vec![0, 10, 20, 30]);
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
pub fn race<F, R>(threads: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    let barrier = Barrier::new(threads);

    thread::scope(|scope| {
        let handles = (0..threads)
            .map(|index| {
                let barrier = &barrier;
                let f = &f;

                scope.spawn(move || {
                    barrier.wait();
                    f(index)
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            })
            .collect()
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn watchdog_returns_result() {
        let result = with_watchdog(|| 42);
        assert_eq!(result, 42);
    }

    #[test]
    #[should_panic]
    fn watchdog_resumes_test_panic() {
        let _: u32 = with_watchdog(|| panic!("failing test"));
    }

    #[test]
    fn race_runs_every_index_on_its_own_thread() {
        let thread_ids = Mutex::new(HashSet::new());

        let results = race(8, |index| {
            thread_ids.lock().unwrap().insert(thread::current().id());
            index
        });

        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert_eq!(thread_ids.lock().unwrap().len(), 8);
    }

    #[test]
    fn race_with_no_threads_is_empty() {
        let results = race(0, |index| index);
        assert!(results.is_empty());
    }
}
