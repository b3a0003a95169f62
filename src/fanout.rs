//! Parallel probe fan-out
//!
//! Peer certificate fetches and peer challenge polls share the same shape:
//! spawn one task per target, join the results on a channel sized to the
//! fan-out, and partition successes from failures. The joined failure is
//! only meaningful when every probe failed, which callers decide.

use std::future::Future;

use tokio::sync::mpsc;

/// Run every task to completion and split the outcomes.
///
/// Tasks run concurrently on the runtime; result arrival order is not
/// significant. Callers needing a deadline wrap the whole call in
/// [`tokio::time::timeout`], which drops the receiver and lets in-flight
/// tasks finish into a closed channel.
pub(crate) async fn race_all<T, E, F>(tasks: Vec<F>) -> (Vec<T>, Vec<E>)
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(tasks.len().max(1));
    let count = tasks.len();
    for task in tasks {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await).await;
        });
    }
    drop(tx);

    let mut values = Vec::new();
    let mut errors = Vec::new();
    for _ in 0..count {
        match rx.recv().await {
            Some(Ok(v)) => values.push(v),
            Some(Err(e)) => errors.push(e),
            None => break,
        }
    }
    (values, errors)
}
