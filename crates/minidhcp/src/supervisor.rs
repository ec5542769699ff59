//! Restart loop for the daemon's side services (admin API, SIGHUP listener).
//! The DHCP receive loop is not supervised: its failure ends the process.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A run that lasts this long counts as healthy and clears the failure count.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_failures: u32,
    pub delay: Duration,
}

impl RestartPolicy {
    pub const API: Self = Self {
        max_failures: 10,
        delay: Duration::from_secs(2),
    };

    pub const SIGNALS: Self = Self {
        max_failures: 3,
        delay: Duration::from_secs(5),
    };
}

/// Run `service` on its own task and start it again after an error or a
/// panic. Returning `Ok(())` ends supervision.
pub fn supervise<F, Fut>(name: &'static str, policy: RestartPolicy, service: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let started = Instant::now();
            let reason = match tokio::spawn(service()).await {
                Ok(Ok(())) => {
                    debug!("{name} finished");
                    return;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => format!("panicked: {e}"),
            };

            failures = if started.elapsed() >= HEALTHY_RUN {
                1
            } else {
                failures + 1
            };
            if failures > policy.max_failures {
                error!("{name} failed {failures} times in a row, giving up: {reason}");
                return;
            }

            warn!(
                "{name} stopped ({reason}), restart {failures}/{} in {:?}",
                policy.max_failures, policy.delay
            );
            tokio::time::sleep(policy.delay).await;
        }
    })
}
