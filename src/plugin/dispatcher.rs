//! Concurrent version checks.
//!
//! One task per record, bounded by a semaphore sized from the concurrency
//! mode. Every record yields exactly one `Msg::Checked`, as soon as its own
//! check finishes, whether it succeeded, failed, timed out, panicked or was
//! cancelled.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::model::check::CheckResult;
use crate::model::profile::Concurrency;
use crate::model::record::PluginRecord;
use crate::msg::Msg;
use crate::plugin::checker::{CheckError, VersionChecker};

pub struct SearchDispatcher {
    checker: Arc<dyn VersionChecker>,
    concurrency: Concurrency,
    max_workers: usize,
    timeout: Duration,
}

impl SearchDispatcher {
    pub fn new(
        checker: Arc<dyn VersionChecker>,
        concurrency: Concurrency,
        max_workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            checker,
            concurrency,
            max_workers,
            timeout,
        }
    }

    /// Starts all checks and returns how many results to expect.
    pub fn dispatch(
        &self,
        records: Vec<PluginRecord>,
        tx: UnboundedSender<Msg>,
        cancel: &CancellationToken,
    ) -> usize {
        let expected = records.len();
        let workers = self.concurrency.pool_size(expected, self.max_workers);
        let pool = Arc::new(Semaphore::new(workers));
        tracing::info!(plugins = expected, workers, "dispatching version checks");

        for record in records {
            let record = Arc::new(record);
            let checker = Arc::clone(&self.checker);
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let timeout = self.timeout;

            tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = pool.acquire_owned() => permit.ok(),
                };

                let result = match permit {
                    Some(_permit) => check_one(checker.as_ref(), record, timeout, &cancel).await,
                    None => CheckResult::provider_error(record, CheckError::Cancelled),
                };

                if tx.send(Msg::Checked(result)).is_err() {
                    tracing::debug!("run loop gone, dropping check result");
                }
            });
        }

        expected
    }
}

async fn check_one(
    checker: &dyn VersionChecker,
    record: Arc<PluginRecord>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> CheckResult {
    let outcome = {
        let guarded = AssertUnwindSafe(checker.check(&record)).catch_unwind();
        tokio::select! {
            _ = cancel.cancelled() => Err(CheckError::Cancelled),
            res = tokio::time::timeout(timeout, guarded) => match res {
                Err(_) => Err(CheckError::Timeout(timeout)),
                Ok(Err(panic)) => Err(CheckError::Panicked(panic_message(panic.as_ref()))),
                Ok(Ok(outcome)) => outcome,
            },
        }
    };

    match outcome {
        Ok(outcome) => {
            let result = CheckResult::from_outcome(record, outcome);
            tracing::debug!(plugin = result.name(), code = result.code().label(), "checked");
            result
        }
        Err(err) => {
            tracing::warn!(plugin = record.name(), error = %err, "version check failed");
            CheckResult::provider_error(record, err)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
