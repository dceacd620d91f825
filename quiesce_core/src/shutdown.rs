//! Graceful shutdown helpers.
//!
//! A server that wants to drain before exiting suspends first and only then
//! tears down its runtime:
//!
//! ```rust,no_run
//! # async fn run(controller: quiesce_core::SuspendController) -> anyhow::Result<()> {
//! use std::time::Duration;
//!
//! quiesce_core::shutdown::suspend_on_ctrl_c(&controller, Some(Duration::from_secs(30))).await?;
//! // stop listeners, flush, exit
//! # Ok(())
//! # }
//! ```

use crate::activity::ServerSuspendContext;
use crate::controller::SuspendController;
use crate::operation::OperationResult;
use anyhow::Context;
use std::future::Future;
use std::time::Duration;

/// Wait for `signal`, then suspend and wait for the suspend to finish.
///
/// `timeout` bounds the wait only; see
/// [`OperationHandle::wait`](crate::operation::OperationHandle::wait).
pub async fn suspend_on<F>(
    controller: &SuspendController,
    signal: F,
    context: ServerSuspendContext,
    timeout: Option<Duration>,
) -> OperationResult
where
    F: Future<Output = ()>,
{
    signal.await;
    tracing::info!("Shutdown signal received, suspending server");
    controller.suspend(context, timeout).await
}

/// Wait for Ctrl-C, then run [`graceful_shutdown`].
pub async fn suspend_on_ctrl_c(
    controller: &SuspendController,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received, suspending server");
    graceful_shutdown(controller, timeout).await?;
    Ok(())
}

/// Suspend with a stopping context and wait for it.
///
/// Without an explicit `timeout` the configured `suspend_timeout_secs` is
/// used. Running out of time is logged and otherwise ignored so the caller can
/// carry on stopping; activity failures and cancellation are returned.
pub async fn graceful_shutdown(
    controller: &SuspendController,
    timeout: Option<Duration>,
) -> OperationResult {
    let timeout = timeout.or_else(|| controller.config().suspend_timeout());
    match controller
        .suspend(ServerSuspendContext::stopping(), timeout)
        .await
    {
        Ok(()) => {
            tracing::info!("Server suspended, ready to stop");
            Ok(())
        }
        Err(err) if err.is_timeout() => {
            tracing::warn!("{}; stopping anyway", err);
            Ok(())
        }
        Err(err) => {
            tracing::error!("Graceful shutdown failed: {}", err);
            Err(err)
        }
    }
}
