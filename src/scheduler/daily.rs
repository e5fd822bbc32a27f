//! Daily schedule loop.
//!
//! Runs fire at midnight UTC. The run fired at midnight of day `D + 1`
//! covers logical date `D`. Catch-up is never performed: after a restart
//! (or a run that overran midnight) only the next upcoming fire time is
//! considered.

use std::future::Future;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::{DagDefinition, DagRunReport, Orchestrator, TaskRunner};

/// Totals kept by [`run_daily`] over the life of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    /// Runs that produced a report.
    pub runs: u64,
    /// Reported runs that did not succeed.
    pub failed: u64,
    /// Runs the orchestrator could not execute at all.
    pub errors: u64,
}

impl DailySummary {
    fn record(&mut self, report: &DagRunReport) {
        self.runs += 1;
        if !report.is_success() {
            self.failed += 1;
        }
    }
}

/// Next fire time strictly after `now`, never before the DAG's start date.
pub fn next_fire_time(dag: &DagDefinition, now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);
    // The first run covers the start date itself, so it fires the day after.
    let first = dag
        .start_date
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);
    tomorrow.max(first).and_time(NaiveTime::MIN).and_utc()
}

/// Logical date covered by a run fired at `fire_time`.
pub fn logical_date_for(fire_time: DateTime<Utc>) -> NaiveDate {
    fire_time
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or(NaiveDate::MIN)
}

/// Runs `dag` once per day until `shutdown` resolves.
///
/// Each run completes before the next fire time is computed, so runs
/// never overlap. Only totals are kept; each report is logged by the
/// orchestrator and then dropped.
pub async fn run_daily<O, S>(
    orchestrator: &O,
    dag: &DagDefinition,
    runner: &dyn TaskRunner,
    shutdown: S,
) -> DailySummary
where
    O: Orchestrator + ?Sized,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut summary = DailySummary::default();

    loop {
        let fire_at = next_fire_time(dag, Utc::now());
        let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();
        info!(
            dag_id = %dag.dag_id,
            next_run = %fire_at,
            logical_date = %logical_date_for(fire_at),
            "Waiting for next scheduled run"
        );

        tokio::select! {
            _ = &mut shutdown => {
                info!(
                    dag_id = %dag.dag_id,
                    runs = summary.runs,
                    failed = summary.failed,
                    "Scheduler stopped"
                );
                return summary;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match orchestrator
            .run_dag(dag, runner, logical_date_for(fire_at))
            .await
        {
            Ok(report) => summary.record(&report),
            Err(e) => {
                summary.errors += 1;
                error!(dag_id = %dag.dag_id, error = %e, "Scheduled run could not execute");
            }
        }
    }
}
