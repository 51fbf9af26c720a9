//! Bounded-parallel fan-out of callable units with per-task completion
//! callbacks (spec.md §4.3, C3).
//!
//! Grounded on `shipcat_cli::helm::parallel::reconcile`'s shape - submit
//! everything to a bounded pool, collect results, propagate the first
//! error after the whole batch is awaited - adapted from `ThreadPool` +
//! `mpsc::channel` to `futures::stream::for_each_concurrent`, since the
//! rest of the control plane is single-threaded-async rather than
//! thread-pool-based and most callers close over borrowed state that can't
//! cross a `tokio::spawn`'s `'static` boundary. Each task also carries
//! explicit per-task state (`TaskOutcome::state`) rather than relying on a
//! captured loop variable, per Design Note 9's "callbacks must receive
//! explicit per-task state" flag - `reconcile`'s own `mf`/`mode` capture is
//! exactly the pattern that flag calls out.

use std::future::Future;
use std::sync::Mutex;

use futures::stream::{self, StreamExt};

use paasd_definitions::Result;

/// The outcome of a single task: the explicit state it was submitted with,
/// plus its result.
pub struct TaskOutcome<S> {
    pub state: S,
    pub result: Result<()>,
}

pub struct TaskRunner {
    parallelism: usize,
}

impl TaskRunner {
    pub fn new(parallelism: usize) -> Self {
        TaskRunner {
            parallelism: parallelism.max(1),
        }
    }

    /// Run every `(state, action)` pair bounded by this runner's
    /// parallelism. `callback` fires once per completed task with that
    /// task's own `TaskOutcome`. The pool is drained (every action has
    /// completed) before this returns; if any action errored, the first
    /// error encountered (in completion order) is returned.
    pub async fn run<S, F, Fut, C>(&self, items: Vec<(S, F)>, callback: C) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
        C: Fn(&TaskOutcome<S>),
    {
        let first_err: Mutex<Option<paasd_definitions::Error>> = Mutex::new(None);

        stream::iter(items)
            .for_each_concurrent(Some(self.parallelism), |(state, action)| {
                let first_err = &first_err;
                let callback = &callback;
                async move {
                    let result = action().await;
                    let outcome = TaskOutcome { state, result };
                    callback(&outcome);
                    if let Err(e) = outcome.result {
                        let mut guard = first_err.lock().unwrap();
                        if guard.is_none() {
                            *guard = Some(e);
                        }
                    }
                }
            })
            .await;

        match first_err.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasd_definitions::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_every_task_and_invokes_callback_with_its_own_state() {
        let runner = TaskRunner::new(2);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let items: Vec<(String, _)> = vec!["web", "worker", "beat"]
            .into_iter()
            .map(|ptype| {
                let ptype = ptype.to_string();
                (ptype, move || async move { Ok(()) })
            })
            .collect();

        let seen2 = seen.clone();
        runner
            .run(items, move |outcome: &TaskOutcome<String>| {
                seen2.lock().unwrap().push(outcome.state.clone());
            })
            .await
            .unwrap();

        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec!["beat".to_string(), "web".to_string(), "worker".to_string()]);
    }

    type BoxFut = std::pin::Pin<Box<dyn Future<Output = Result<()>>>>;

    #[tokio::test]
    async fn propagates_first_error_after_draining_the_batch() {
        let runner = TaskRunner::new(4);
        let completed = Arc::new(AtomicUsize::new(0));
        let c1 = completed.clone();
        let c2 = completed.clone();
        let items: Vec<(u32, Box<dyn FnOnce() -> BoxFut>)> = vec![
            (
                1u32,
                Box::new(move || {
                    Box::pin(async move {
                        c1.fetch_add(1, Ordering::SeqCst);
                        let e: paasd_definitions::Error = ErrorKind::ServiceUnavailable("boom".into()).into();
                        Err(e)
                    }) as BoxFut
                }),
            ),
            (
                2u32,
                Box::new(move || {
                    Box::pin(async move {
                        c2.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }) as BoxFut
                }),
            ),
        ];
        let err = runner.run(items, |_: &TaskOutcome<u32>| {}).await.unwrap_err();
        assert!(format!("{}", err).contains("boom"));
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }
}
