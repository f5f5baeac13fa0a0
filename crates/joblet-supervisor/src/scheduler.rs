//! Wall-clock promotion of SCHEDULED jobs.

use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::Supervisor;

/// How often the scheduler checks for due jobs.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run forever, promoting scheduled jobs as their time arrives. Spawned once
/// at daemon startup.
pub async fn run(supervisor: Supervisor) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for job in supervisor.store().due_scheduled(Utc::now()) {
            if let Err(err) = supervisor.execute_scheduled_job(&job.id).await {
                // Raced a concurrent stop, or the spawn itself failed; the
                // record already carries the outcome.
                warn!(job_id = %job.id, error = %err, "Scheduled promotion failed");
            }
        }
    }
}
