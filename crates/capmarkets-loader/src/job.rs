//! ETL 작업.

use crate::error::Result;
use crate::extract::Extractor;
use crate::recovery::RecoveryLoader;
use crate::stats::LoadStats;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// 스케줄러와 서비스가 호출하는 작업 단위.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, target_date: NaiveDate) -> Result<LoadStats>;
}

/// 추출 → 적재 (→ 보존 기간 정리) 작업.
pub struct EtlJob {
    name: String,
    extractor: Arc<dyn Extractor>,
    loader: Arc<dyn RecoveryLoader>,
    retention: Option<Duration>,
}

impl EtlJob {
    pub fn new(
        name: impl Into<String>,
        extractor: Arc<dyn Extractor>,
        loader: Arc<dyn RecoveryLoader>,
    ) -> Self {
        Self {
            name: name.into(),
            extractor,
            loader,
            retention: None,
        }
    }

    /// 적재 후 `days`일보다 오래된 데이터를 삭제합니다.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention = (days > 0).then(|| Duration::days(days));
        self
    }

    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    pub fn loader(&self) -> &Arc<dyn RecoveryLoader> {
        &self.loader
    }
}

#[async_trait]
impl Job for EtlJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, target_date: NaiveDate) -> Result<LoadStats> {
        info!(job = %self.name, target_date = %target_date, "Starting ETL job");

        let data = self.extractor.extract(target_date).await?;
        let stats = self.loader.load(data, target_date).await?;

        if let Some(retention) = self.retention {
            let cutoff = Utc::now() - retention;
            // 정리 실패는 적재 결과에 영향을 주지 않음
            if let Err(e) = self.loader.purge_before(cutoff).await {
                warn!(job = %self.name, error = %e, "Retention cleanup failed");
            }
        }

        stats.log_summary(&self.name);
        Ok(stats)
    }
}
