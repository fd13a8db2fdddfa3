//! First-success race across independent candidates.
//!
//! Every candidate is spawned onto the runtime. The first `Ok` wins; a fast
//! failure never short-circuits the candidates still in flight. Once a winner
//! is known the remaining tasks are detached rather than aborted, so their
//! own cleanup (temp workspaces, open files) still runs to completion. Their
//! results are dropped with the task.

use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::error::{AggregateError, FetchError, Result};

/// One pending alternative.
pub struct Candidate<T> {
    label: String,
    future: BoxFuture<'static, Result<T>>,
}

impl<T> Candidate<T> {
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            label: label.into(),
            future: Box::pin(future),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Resolve with the first candidate that succeeds.
///
/// Fails with an [`AggregateError`] holding one entry per candidate when all
/// of them fail, or an empty aggregate when `candidates` is empty.
pub async fn race_ok<T>(candidates: Vec<Candidate<T>>) -> std::result::Result<T, AggregateError>
where
    T: Send + 'static,
{
    let mut pending: FuturesUnordered<_> = candidates
        .into_iter()
        .map(|candidate| {
            let label = candidate.label;
            let handle = tokio::spawn(candidate.future);
            async move { (label, handle.await) }
        })
        .collect();

    let mut aggregate = AggregateError::new();

    while let Some((label, joined)) = pending.next().await {
        match joined {
            Ok(Ok(value)) => {
                debug!(
                    "Candidate {} won; detaching {} still in flight",
                    label,
                    pending.len()
                );
                return Ok(value);
            }
            Ok(Err(err)) => {
                debug!("Candidate {} failed: {}", label, err);
                aggregate.push(label, err);
            }
            Err(join_err) => {
                aggregate.push(label, FetchError::Other(format!("candidate panicked: {}", join_err)));
            }
        }
    }

    Err(aggregate)
}
