//! Deferred-action pipeline
//!
//! A failover is modelled as an ordered list of steps, where each step may
//! carry a cleanup action that is scheduled before the primary operation ever
//! takes place. This expresses the steps clearly and keeps the error handling
//! and logging noise out of the orchestration code.
//!
//! Forward progress and cleanup run under two independent cancellation
//! scopes: cancelling the forward scope aborts the remaining steps but the
//! cleanup stack still drains, so an aborted run releases whatever it
//! acquired.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use slog::{debug, error, Logger};
use std::future::Future;
use tokio_util::sync::CancellationToken;

type ActionFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One named pipeline step with an optional cleanup action.
pub struct Step {
    name: &'static str,
    forward: ActionFn,
    cleanup: Option<(&'static str, ActionFn)>,
}

impl Step {
    pub fn new<F, Fut>(name: &'static str, forward: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            forward: Box::new(move || Box::pin(forward())),
            cleanup: None,
        }
    }

    /// Attach a cleanup action. It is pushed onto the cleanup stack before
    /// the forward action runs, so a step that has partial effect before
    /// returning an error still gets cleaned up.
    pub fn with_cleanup<F, Fut>(mut self, name: &'static str, cleanup: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.cleanup = Some((name, Box::new(move || Box::pin(cleanup()))));
        self
    }
}

/// An ordered list of steps with guaranteed deferred cleanup.
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Run the steps in declared order, then drain the cleanup stack LIFO.
    ///
    /// `exec` cancels forward progress; `defer` governs only the cleanup
    /// drain. The first forward error is returned to the caller; cleanup
    /// errors are logged and never mask it.
    pub async fn run(
        self,
        logger: &Logger,
        exec: &CancellationToken,
        defer: &CancellationToken,
    ) -> Result<()> {
        let mut cleanups: Vec<(&'static str, ActionFn)> = Vec::new();

        let mut outcome = Ok(());
        for step in self.steps {
            if let Some(cleanup) = step.cleanup {
                cleanups.push(cleanup);
            }

            debug!(logger, "running step"; "step" => step.name);
            let result = tokio::select! {
                _ = exec.cancelled() => Err(Error::Aborted),
                result = (step.forward)() => result,
            };

            if let Err(err) = result {
                error!(logger, "step failed"; "step" => step.name, "error" => %err);
                outcome = Err(err);
                break;
            }
        }

        while let Some((name, cleanup)) = cleanups.pop() {
            debug!(logger, "running cleanup"; "step" => name);
            let result = tokio::select! {
                _ = defer.cancelled() => Err(Error::Aborted),
                result = cleanup() => result,
            };

            if let Err(err) = result {
                error!(logger, "cleanup failed"; "step" => name, "error" => %err);
            }
        }

        outcome
    }
}
