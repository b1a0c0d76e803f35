//! Background housekeeping for quiz attempts: timeouts, abandonment and
//! gradebook resync.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::AppResult;
use crate::models::SweepReport;
use crate::services::Engine;

/// One pass over live and pending attempts.
pub async fn run_once(engine: &Engine) -> AppResult<SweepReport> {
    let report = engine.attempts.sweep(Utc::now()).await?;
    if report != SweepReport::default() {
        tracing::info!(
            timed_out = report.timed_out,
            abandoned = report.abandoned,
            synced = report.synced,
            failed = report.failed,
            "attempt sweep finished"
        );
    }
    Ok(report)
}

/// Start the periodic sweep. Returns `None` when the interval is 0.
pub fn spawn(engine: Engine) -> Option<JoinHandle<()>> {
    let secs = engine.config.sweep_interval_secs;
    if secs == 0 {
        tracing::info!("attempt sweep disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_once(&engine).await {
                tracing::error!(error = %e, "attempt sweep failed");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::testkit::fixture_with;

    #[tokio::test]
    async fn disabled_interval_spawns_nothing() {
        let fx = fixture_with(Vec::new(), Config { sweep_interval_secs: 0, ..Config::default() });
        assert!(spawn(fx.engine).is_none());
    }

    #[tokio::test]
    async fn empty_store_sweeps_cleanly() {
        let fx = fixture_with(Vec::new(), Config::default());
        assert_eq!(run_once(&fx.engine).await.unwrap(), SweepReport::default());
    }
}
