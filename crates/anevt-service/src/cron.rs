//! Periodic background execution of registered handlers.
//!
//! The typical use is cache warming: running a memoized query on a schedule
//! keeps its cache line fresh so interactive callers always hit.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::caching::QueryArgs;
use crate::registry::Handler;

/// When and how a handler runs in the background.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// The interval between runs.
    pub run_every: Duration,

    /// Recompute on every run instead of settling for a cached result.
    pub force_memoize: bool,

    /// The arguments of each run.
    pub params: QueryArgs,
}

/// Spawns a background task running `handler` on the given schedule.
///
/// The first run happens one full interval after spawning. A failing run is
/// logged and the schedule continues. The task runs until the returned
/// handle is aborted or the runtime shuts down.
pub fn spawn_cron(schedule: CronSchedule, handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = format!("{}/{}", handler.info().category, handler.info().name);
        let mut interval = tokio::time::interval(schedule.run_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; consume it so
        // runs start one interval in.
        interval.tick().await;

        loop {
            interval.tick().await;
            metric!(counter("cron.run") += 1, "handler" => &name);

            let result = if schedule.force_memoize {
                handler.force_recompute(schedule.params.clone()).await
            } else {
                handler.call(schedule.params.clone()).await
            };
            if let Err(error) = result {
                tracing::error!(
                    handler = %name,
                    error = format!("{error:#}"),
                    "Scheduled run failed",
                );
            } else {
                tracing::debug!(handler = %name, "Scheduled run finished");
            }
        }
    })
}
