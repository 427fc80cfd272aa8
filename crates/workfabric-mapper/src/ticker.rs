//! Periodic-Timer Glue
//!
//! Thin wrapper over a spawned interval task. The mapper runs two of
//! these: the heartbeat reaper and the offline `recover` sweep. The task
//! handle is retained so the ticker can be cancelled explicitly on
//! `stop()`, and dropping a ticker aborts it as well.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A named periodic task firing `tick` every `period`.
pub struct Ticker {
    name: String,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn the interval loop. The first tick fires one full period
    /// after the call, not immediately.
    pub fn every<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // tokio intervals complete their first tick immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!(ticker = %task_name, "tick");
                tick().await;
            }
        });
        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the ticker. Safe to call more than once.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
