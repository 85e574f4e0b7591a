//! The concurrency supervisor: the `run` entry point, monitored tasks and
//! structured cancellation helpers.
//!
//! `run` starts the simulation task, launches the supporting tasks and
//! joins them so that the first failure is surfaced: if any task exits,
//! the remainder is cancelled and awaited. Cancellation alone is a normal
//! exit.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::circuit::Circuit;
use crate::error::{CircuitError, SimResult};

/// A host-level task running concurrently with the simulation, jointly
/// supervised by [`run`].
pub struct SupportTask {
    name: String,
    future: BoxFuture<'static, SimResult<()>>,
}

/// Wrap a future as a named supporting task.
pub fn support<F>(name: &str, future: F) -> SupportTask
where
    F: Future<Output = SimResult<()>> + Send + 'static,
{
    SupportTask {
        name: name.to_string(),
        future: Box::pin(future),
    }
}

/// Spawn a monitored task: if it fails, the simulation is aborted with its
/// error. With `is_service = true` even a normal exit counts as an error.
/// Cancellation is never an error.
pub fn spawn_monitored<F>(
    circuit: &Arc<Circuit>,
    name: &str,
    is_service: bool,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = SimResult<()>> + Send + 'static,
{
    let circuit = circuit.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        match future.await {
            Ok(()) => {
                if is_service {
                    circuit.abort(CircuitError::Block {
                        block: name,
                        message: "unexpected task termination".into(),
                    });
                }
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => circuit.abort(err.in_block(&name)),
        }
    })
}

/// Protect a short critical section from cancellation.
///
/// The future runs to completion without observing the token; a
/// cancellation that arrived meanwhile is surfaced afterwards. Must never
/// be used to suppress cancellation entirely.
pub async fn shield_from_cancel<F>(token: &CancellationToken, future: F) -> SimResult<F::Output>
where
    F: Future,
{
    let output = future.await;
    if token.is_cancelled() {
        return Err(CircuitError::Cancelled(
            "cancelled during a shielded section".into(),
        ));
    }
    Ok(output)
}

async fn sigterm_listener(circuit: Arc<Circuit>) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "cannot install the SIGTERM handler");
                    return;
                }
            };
        if sigterm.recv().await.is_some() {
            warn!("signal SIGTERM caught");
            circuit.abort(CircuitError::Cancelled("SIGTERM".into()));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = circuit;
        std::future::pending::<()>().await;
    }
}

/// Run the simulation and the supporting tasks until the first of them
/// exits, then cancel and await the rest.
///
/// Returns `Ok(())` when everything ended normally or by cancellation
/// (including SIGTERM). If the simulation failed, its error is re-raised;
/// else a failing supporting task's error is re-raised with a note naming
/// the task.
pub async fn run(
    circuit: Arc<Circuit>,
    tasks: Vec<SupportTask>,
    catch_sigterm: bool,
) -> SimResult<()> {
    let sigterm_task = catch_sigterm.then(|| tokio::spawn(sigterm_listener(circuit.clone())));

    let result = run_supervised(&circuit, tasks).await;

    if let Some(handle) = sigterm_task {
        handle.abort();
    }
    result
}

async fn run_supervised(circuit: &Arc<Circuit>, tasks: Vec<SupportTask>) -> SimResult<()> {
    if tasks.is_empty() {
        // no need for extra tasks in this trivial case
        return match circuit.clone().run_forever().await {
            Err(err) if err.is_cancelled() => Ok(()),
            other => other,
        };
    }

    let support_token = CancellationToken::new();
    let mut names: Vec<String> = vec!["simulation".to_string()];
    let mut handles: Vec<JoinHandle<SimResult<()>>> =
        vec![tokio::spawn(circuit.clone().run_forever())];
    for task in tasks {
        names.push(task.name);
        let token = support_token.child_token();
        let future = task.future;
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(CircuitError::Cancelled("shutdown".into())),
                result = future => result,
            }
        }));
    }

    // wait for the first task to finish
    let mut indices: Vec<usize> = (0..handles.len()).collect();
    let (first_result, first_idx, remaining) = futures::future::select_all(handles).await;
    let mut results: Vec<(usize, Result<SimResult<()>, tokio::task::JoinError>)> =
        vec![(indices.remove(first_idx), first_result)];

    // cancel the rest; a direct simulation-task abort would skip cleanup
    circuit.abort(CircuitError::Cancelled("shutdown".into()));
    support_token.cancel();
    for (position, handle) in remaining.into_iter().enumerate() {
        let index = indices[position];
        results.push((index, handle.await));
    }

    let mut sim_error: Option<CircuitError> = None;
    let mut support_error: Option<(String, CircuitError)> = None;
    for (index, joined) in results {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => continue,
            Err(join_err) => Err(CircuitError::Block {
                block: names[index].clone(),
                message: format!("task failed: {join_err}"),
            }),
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(task = %names[index], error = %err, "supervised task error");
                if index == 0 {
                    sim_error = Some(err);
                } else if support_error.is_none() {
                    support_error = Some((names[index].clone(), err));
                }
            }
        }
    }

    if let Some(err) = sim_error {
        return Err(err);
    }
    if let Some((name, err)) = support_error {
        return Err(CircuitError::Block {
            block: name,
            message: format!("supporting task failed: {err}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shield_runs_to_completion() {
        let token = CancellationToken::new();
        let value = shield_from_cancel(&token, async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_shield_surfaces_pending_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = shield_from_cancel(&token, async { 42 }).await;
        assert!(matches!(result, Err(CircuitError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_spawn_monitored_service_exit_aborts() {
        let circuit = Circuit::new_arc();
        let handle = spawn_monitored(&circuit, "svc", true, async { Ok(()) });
        let _ = handle.await;
        assert!(circuit.error().is_some());
    }

    #[tokio::test]
    async fn test_spawn_monitored_cancellation_is_not_an_error() {
        let circuit = Circuit::new_arc();
        let handle = spawn_monitored(&circuit, "task", false, async {
            Err(CircuitError::Cancelled("bye".into()))
        });
        let _ = handle.await;
        assert!(circuit.error().is_none());
    }
}
