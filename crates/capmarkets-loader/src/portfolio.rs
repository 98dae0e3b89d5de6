//! 포트폴리오 성과 적재.
//!
//! 날짜마다 문서 하나 (`date`, 일간 수익률, 누적 수익률)를 저장합니다.
//! 같은 날짜 문서가 이미 있으면 아무것도 쓰지 않으므로 재실행해도 안전합니다.
//! 누적 수익률은 대상 날짜 이전의 가장 최근 문서에서 이어집니다.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::job::Job;
use crate::record::day_bounds;
use crate::stats::LoadStats;
use async_trait::async_trait;
use capmarkets_store::{
    format_timestamp, ConnectionFactory, Document, Filter, FindOptions, StoreConnector,
};
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument};

pub const DAILY_RETURN_FIELD: &str = "percentage_of_daily_return";
pub const CUMULATIVE_RETURN_FIELD: &str = "percentage_of_cumulative_return";

/// 하루치 성과.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub date: NaiveDate,
    /// 일간 수익률 (%)
    pub daily_return: f64,
    /// 누적 수익률 (%)
    pub cumulative_return: f64,
}

impl PerformanceRecord {
    /// `date`는 해당 날짜 00:00 UTC로 저장합니다.
    pub fn into_document(self) -> Document {
        let (midnight, _) = day_bounds(self.date);
        let mut doc = Document::new();
        doc.insert(
            Dataset::PortfolioPerformance.time_field().to_string(),
            Value::String(format_timestamp(&midnight)),
        );
        doc.insert(DAILY_RETURN_FIELD.to_string(), json!(self.daily_return));
        doc.insert(
            CUMULATIVE_RETURN_FIELD.to_string(),
            json!(self.cumulative_return),
        );
        doc
    }
}

/// 수익률 생성 규칙.
pub trait ReturnModel: Send + Sync {
    /// 직전 누적 수익률로 `(일간, 누적)`을 만듭니다. 첫 기록이면 `None`.
    fn next(&self, previous_cumulative: Option<f64>) -> (f64, f64);
}

/// 무작위 보행 수익률.
///
/// 첫 날은 ±1%, 이후는 ±1.5% 범위의 일간 수익률에 0.8~1.2배 가중치를 곱해
/// 누적합니다. 값은 소수 둘째 자리로 반올림합니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomWalkReturns;

impl ReturnModel for RandomWalkReturns {
    fn next(&self, previous_cumulative: Option<f64>) -> (f64, f64) {
        let mut rng = rand::thread_rng();
        match previous_cumulative {
            Some(previous) => {
                let daily = round2(rng.gen_range(-1.5..=1.5));
                let weight: f64 = rng.gen_range(0.8..=1.2);
                (daily, round2(previous + daily * weight))
            }
            None => {
                let daily = round2(rng.gen_range(-1.0..=1.0));
                (daily, daily)
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 날짜 하나의 처리 결과.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertOutcome {
    Inserted(PerformanceRecord),
    /// 이미 문서가 있어 그대로 둠
    Exists,
}

/// 포트폴리오 성과 로더.
pub struct PortfolioPerformanceLoader {
    connector: StoreConnector,
    model: Arc<dyn ReturnModel>,
}

impl PortfolioPerformanceLoader {
    pub fn new(connector: StoreConnector, model: Arc<dyn ReturnModel>) -> Self {
        Self { connector, model }
    }

    pub fn from_factory(
        factory: Arc<ConnectionFactory>,
        collection: &str,
        model: Arc<dyn ReturnModel>,
    ) -> Result<Self> {
        Ok(Self::new(StoreConnector::new(factory, collection)?, model))
    }

    pub fn connector(&self) -> &StoreConnector {
        &self.connector
    }

    /// `date`의 문서가 없을 때만 새 성과를 계산해 삽입합니다.
    #[instrument(skip(self), fields(collection = %self.connector.collection()))]
    pub async fn insert_for_date(&self, date: NaiveDate) -> Result<InsertOutcome> {
        let time_field = Dataset::PortfolioPerformance.time_field();
        let (start, end) = day_bounds(date);

        let existing = self
            .connector
            .count(&Filter::all().time_range(time_field, start, end))
            .await?;
        if existing > 0 {
            info!(date = %date, "Portfolio performance already stored, skipping");
            return Ok(InsertOutcome::Exists);
        }

        let previous = self
            .connector
            .find_one(
                &Filter::all().before(time_field, start),
                FindOptions::sort_desc(time_field),
            )
            .await?;
        // 직전 문서에 누적 값이 없으면 0에서 이어감
        let previous_cumulative = previous.map(|doc| {
            doc.get(CUMULATIVE_RETURN_FIELD)
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        });

        let (daily_return, cumulative_return) = self.model.next(previous_cumulative);
        let record = PerformanceRecord {
            date,
            daily_return,
            cumulative_return,
        };
        self.connector.insert_one(record.into_document()).await?;

        info!(
            date = %date,
            daily_return = daily_return,
            cumulative_return = cumulative_return,
            "Inserted portfolio performance"
        );
        Ok(InsertOutcome::Inserted(record))
    }
}

/// 스케줄러/서비스용 포트폴리오 작업.
pub struct PortfolioJob {
    name: String,
    loader: Arc<PortfolioPerformanceLoader>,
}

impl PortfolioJob {
    pub fn new(name: impl Into<String>, loader: Arc<PortfolioPerformanceLoader>) -> Self {
        Self {
            name: name.into(),
            loader,
        }
    }
}

#[async_trait]
impl Job for PortfolioJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, target_date: NaiveDate) -> Result<LoadStats> {
        let started = std::time::Instant::now();
        let mut stats = LoadStats {
            total: 1,
            ..LoadStats::default()
        };
        match self.loader.insert_for_date(target_date).await? {
            InsertOutcome::Inserted(_) => {
                stats.inserted = 1;
                stats.records_written = 1;
            }
            InsertOutcome::Exists => stats.unchanged = 1,
        }
        stats.elapsed = started.elapsed();
        stats.log_summary(&self.name);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmarkets_store::{MemoryDriver, StoreConfig};
    use std::sync::Mutex;

    /// 정해진 일간 수익률을 돌려주고 받은 직전 누적 값을 기록
    struct FixedReturns {
        daily: f64,
        seen: Mutex<Vec<Option<f64>>>,
    }

    impl ReturnModel for FixedReturns {
        fn next(&self, previous_cumulative: Option<f64>) -> (f64, f64) {
            self.seen.lock().unwrap().push(previous_cumulative);
            let cumulative = previous_cumulative.unwrap_or(0.0) + self.daily;
            (self.daily, round2(cumulative))
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn loader_with(model: Arc<dyn ReturnModel>) -> PortfolioPerformanceLoader {
        let factory = Arc::new(ConnectionFactory::new(
            Arc::new(MemoryDriver::new()),
            StoreConfig::in_memory("portfolio"),
        ));
        PortfolioPerformanceLoader::from_factory(
            factory,
            Dataset::PortfolioPerformance.default_collection(),
            model,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_skipped_when_date_exists() {
        let model = Arc::new(FixedReturns {
            daily: 0.5,
            seen: Mutex::new(Vec::new()),
        });
        let loader = loader_with(model.clone());

        let first = loader.insert_for_date(date(2025, 6, 24)).await.unwrap();
        let second = loader.insert_for_date(date(2025, 6, 24)).await.unwrap();

        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Exists);
        assert_eq!(loader.connector().count(&Filter::all()).await.unwrap(), 1);
        assert_eq!(model.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cumulative_continues_from_latest_earlier_day() {
        let model = Arc::new(FixedReturns {
            daily: 0.25,
            seen: Mutex::new(Vec::new()),
        });
        let loader = loader_with(model.clone());

        loader.insert_for_date(date(2025, 6, 20)).await.unwrap();
        loader.insert_for_date(date(2025, 6, 23)).await.unwrap();
        // 뒤 날짜가 먼저 있어도 이전 날짜만 기준으로 삼음
        let outcome = loader.insert_for_date(date(2025, 6, 21)).await.unwrap();

        assert_eq!(
            *model.seen.lock().unwrap(),
            vec![None, Some(0.25), Some(0.25)]
        );
        let InsertOutcome::Inserted(record) = outcome else {
            panic!("expected insert");
        };
        assert_eq!(record.cumulative_return, 0.5);

        let doc = loader
            .connector()
            .find_one(
                &Filter::all().eq("date", "2025-06-21T00:00:00Z"),
                FindOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc[DAILY_RETURN_FIELD], json!(0.25));
        assert_eq!(doc[CUMULATIVE_RETURN_FIELD], json!(0.5));
    }

    #[tokio::test]
    async fn test_previous_without_cumulative_starts_from_zero() {
        let model = Arc::new(FixedReturns {
            daily: 1.0,
            seen: Mutex::new(Vec::new()),
        });
        let loader = loader_with(model.clone());
        let mut legacy = Document::new();
        legacy.insert("date".into(), json!("2025-06-01T00:00:00Z"));
        loader.connector().insert_one(legacy).await.unwrap();

        loader.insert_for_date(date(2025, 6, 2)).await.unwrap();

        assert_eq!(*model.seen.lock().unwrap(), vec![Some(0.0)]);
    }

    #[tokio::test]
    async fn test_job_reports_insert_and_exists() {
        let loader = Arc::new(loader_with(Arc::new(RandomWalkReturns)));
        let job = PortfolioJob::new("portfolio_daily", loader);

        let inserted = job.run(date(2025, 6, 24)).await.unwrap();
        let kept = job.run(date(2025, 6, 24)).await.unwrap();

        assert_eq!((inserted.inserted, inserted.records_written), (1, 1));
        assert_eq!((kept.inserted, kept.unchanged), (0, 1));
        assert_eq!(job.name(), "portfolio_daily");
    }

    #[test]
    fn test_random_walk_stays_in_range() {
        let model = RandomWalkReturns;
        for _ in 0..200 {
            let (daily, cumulative) = model.next(None);
            assert!((-1.0..=1.0).contains(&daily));
            assert_eq!(daily, cumulative);

            let (daily, cumulative) = model.next(Some(10.0));
            assert!((-1.5..=1.5).contains(&daily));
            assert!((cumulative - 10.0).abs() <= 1.5 * 1.2 + 0.01);
            assert_eq!(round2(daily), daily);
        }
    }
}
