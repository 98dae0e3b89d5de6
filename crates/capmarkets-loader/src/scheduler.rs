//! 일일 적재 스케줄러.
//!
//! 설정된 요일/시각(UTC)에 각 작업을 전날 날짜로 한 번씩 실행합니다.
//! 작업 하나의 실패는 기록 후 다음 작업으로 넘어가며 루프는 계속됩니다.

use crate::job::Job;
use crate::stats::LoadStats;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use std::sync::Arc;
use tracing::{error, info};

/// 스케줄에 등록된 작업
pub struct ScheduledJob {
    job: Arc<dyn Job>,
    at: NaiveTime,
    weekdays: Vec<Weekday>,
    last_run: Option<NaiveDate>,
}

impl ScheduledJob {
    pub fn new(job: Arc<dyn Job>, at: NaiveTime, weekdays: Vec<Weekday>) -> Self {
        Self {
            job,
            at,
            weekdays,
            last_run: None,
        }
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }

    /// `now` 시점에 실행할 차례인지 판단합니다. 같은 날 두 번 실행하지 않습니다.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        self.weekdays.contains(&today.weekday())
            && now.time() >= self.at
            && self.last_run != Some(today)
    }
}

/// 스케줄러
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: ScheduledJob) {
        info!(
            job = %job.name(),
            at = %job.at.format("%H:%M"),
            weekdays = ?job.weekdays,
            "Job scheduled"
        );
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// 실행할 차례인 작업을 모두 전날 날짜로 실행하고 완료된 작업 수를 반환합니다.
    pub async fn run_pending(&mut self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let target = today - Duration::days(1);
        let mut completed = 0;

        for scheduled in self.jobs.iter_mut().filter(|j| j.is_due(now)) {
            // 실패해도 같은 날 재시도하지 않음
            scheduled.last_run = Some(today);
            match scheduled.job.run(target).await {
                Ok(stats) => {
                    completed += 1;
                    log_completion(scheduled.job.name(), target, &stats);
                }
                Err(e) => {
                    error!(
                        job = %scheduled.job.name(),
                        target_date = %target,
                        systemic = e.is_systemic(),
                        error = %e,
                        "Scheduled job failed"
                    );
                }
            }
        }
        completed
    }

    /// Ctrl+C를 받을 때까지 `poll_interval`마다 `run_pending`을 호출합니다.
    pub async fn run_until_shutdown(&mut self, poll_interval: std::time::Duration) {
        info!(jobs = self.jobs.len(), "=== 스케줄러 시작 ===");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("종료 신호 수신, 스케줄러 종료 중...");
                    break;
                }
                _ = interval.tick() => {
                    self.run_pending(Utc::now()).await;
                }
            }
        }
    }
}

fn log_completion(name: &str, target: NaiveDate, stats: &LoadStats) {
    info!(
        job = %name,
        target_date = %target,
        loaded = stats.loaded(),
        skipped = stats.skipped,
        errors = stats.errors,
        "Scheduled job finished"
    );
}
