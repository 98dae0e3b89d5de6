//! 온디맨드 적재 서비스.
//!
//! 특정 날짜 적재, 기간 백필, 스냅샷 백업, 보존 기간 정리를 제공합니다.
//! 날짜 검증은 스토어에 접근하기 전에 수행합니다. 포트폴리오 성과도 같은
//! 적재/백필 경로를 쓰며, 심볼 단위 작업과 백업/정리는 지원하지 않습니다.

use crate::config::LoaderConfig;
use crate::dataset::Dataset;
use crate::error::{LoaderError, Result};
use crate::extract::{Extractor, JsonDirExtractor};
use crate::job::{EtlJob, Job};
use crate::portfolio::{PortfolioJob, PortfolioPerformanceLoader, RandomWalkReturns, ReturnModel};
use crate::record::{parse_date, TabularBatch};
use crate::recovery::{DatasetLoader, RecoveryLoader, SymbolBatches};
use crate::snapshot::{SnapshotStore, SnapshotWriter};
use crate::stats::LoadStats;
use capmarkets_store::{ConnectionFactory, StoreConnector};
use chrono::{Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 백필 결과
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    /// 성공한 날짜들의 누적 통계
    pub stats: LoadStats,
    /// 성공한 날짜 수
    pub succeeded: usize,
    /// 실패한 날짜
    pub failed_dates: Vec<NaiveDate>,
}

/// 적재 서비스
pub struct LoaderService {
    config: LoaderConfig,
    factory: Arc<ConnectionFactory>,
    extractors: HashMap<Dataset, Arc<dyn Extractor>>,
    returns: Arc<dyn ReturnModel>,
}

impl LoaderService {
    /// 공유 팩토리 위에 서비스를 만듭니다. 추출기는 inbox 디렉터리 기반입니다.
    pub fn new(config: LoaderConfig, factory: Arc<ConnectionFactory>) -> Self {
        let extractors = Dataset::SYMBOL_KEYED
            .into_iter()
            .map(|dataset| {
                let ds = config.dataset(dataset);
                let extractor: Arc<dyn Extractor> = Arc::new(JsonDirExtractor::new(
                    dataset,
                    config.inbox_dir.clone(),
                    ds.symbols.clone(),
                ));
                (dataset, extractor)
            })
            .collect();
        Self {
            config,
            factory,
            extractors,
            returns: Arc::new(RandomWalkReturns),
        }
    }

    /// 설정의 스토어 URI로 팩토리를 만들어 서비스를 생성합니다.
    pub fn from_config(config: LoaderConfig) -> Result<Self> {
        let factory = Arc::new(ConnectionFactory::from_config(config.store.clone())?);
        Ok(Self::new(config, factory))
    }

    /// 데이터셋의 추출기를 교체합니다.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(extractor.dataset(), extractor);
        self
    }

    /// 포트폴리오 수익률 생성 규칙을 교체합니다.
    pub fn with_return_model(mut self, model: Arc<dyn ReturnModel>) -> Self {
        self.returns = model;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// 데이터셋 로더 생성 (호출마다 새로 만듦)
    pub fn loader(&self, dataset: Dataset) -> Result<DatasetLoader> {
        require_symbol_keyed(dataset)?;
        DatasetLoader::from_factory(
            dataset,
            Arc::clone(&self.factory),
            &self.config.dataset(dataset).collection,
            SnapshotStore::new(self.config.snapshot_dir.clone()),
        )
    }

    /// 포트폴리오 성과 로더 생성
    pub fn portfolio_loader(&self) -> Result<PortfolioPerformanceLoader> {
        PortfolioPerformanceLoader::from_factory(
            Arc::clone(&self.factory),
            &self.config.dataset(Dataset::PortfolioPerformance).collection,
            Arc::clone(&self.returns),
        )
    }

    /// 스케줄러용 작업 생성
    ///
    /// 심볼 기반 데이터셋은 ETL 작업, 포트폴리오는 날짜별 삽입 작업입니다.
    pub fn job(&self, dataset: Dataset) -> Result<Arc<dyn Job>> {
        if !dataset.is_symbol_keyed() {
            let loader = Arc::new(self.portfolio_loader()?);
            return Ok(Arc::new(PortfolioJob::new(
                format!("{}_daily", dataset),
                loader,
            )));
        }

        let loader: Arc<dyn RecoveryLoader> = Arc::new(self.loader(dataset)?);
        Ok(Arc::new(
            EtlJob::new(
                format!("{}_etl", dataset),
                Arc::clone(self.extractor(dataset)?),
                loader,
            )
            .with_retention_days(self.config.retention_days),
        ))
    }

    /// 어제 날짜를 적재합니다 (스케줄 실행과 같은 대상).
    pub async fn load_yesterday(&self, dataset: Dataset) -> Result<LoadStats> {
        let date = today() - Duration::days(1);
        info!(dataset = %dataset, date = %date, "Starting load for yesterday");
        self.job(dataset)?.run(date).await
    }

    /// `date_str`(YYYYMMDD) 하루치를 적재합니다. 오늘/미래 날짜는 거부합니다.
    pub async fn load_for_date(&self, dataset: Dataset, date_str: &str) -> Result<LoadStats> {
        let date = validate_target_date(date_str, today())?;
        info!(dataset = %dataset, date = %date, "Starting load for date");
        self.job(dataset)?.run(date).await
    }

    /// 특정 심볼만 적재합니다.
    pub async fn load_for_date_by_symbol(
        &self,
        dataset: Dataset,
        date_str: &str,
        symbol: &str,
    ) -> Result<LoadStats> {
        let date = validate_target_date(date_str, today())?;
        require_symbol_keyed(dataset)?;
        info!(dataset = %dataset, date = %date, symbol = %symbol, "Starting load for symbol");
        self.load_symbol_on(dataset, date, symbol).await
    }

    /// `[start, end]` 기간을 날짜 순서대로 적재합니다.
    ///
    /// 날짜 하나의 실패는 기록 후 다음 날짜로 넘어갑니다.
    pub async fn backfill(
        &self,
        dataset: Dataset,
        start: &str,
        end: &str,
    ) -> Result<BackfillReport> {
        self.backfill_inner(dataset, start, end, None).await
    }

    /// 특정 심볼만 백필합니다.
    pub async fn backfill_by_symbol(
        &self,
        dataset: Dataset,
        start: &str,
        end: &str,
        symbol: &str,
    ) -> Result<BackfillReport> {
        self.backfill_inner(dataset, start, end, Some(symbol)).await
    }

    /// 설정된 심볼들의 하루치 데이터를 스냅샷 파일로 저장합니다.
    pub async fn backup(&self, dataset: Dataset, date_str: &str) -> Result<usize> {
        let date = parse_date(date_str)?;
        require_symbol_keyed(dataset)?;
        let ds = self.config.dataset(dataset);
        let connector = StoreConnector::new(Arc::clone(&self.factory), ds.collection.as_str())?;
        let writer = SnapshotWriter::new(
            dataset,
            connector,
            SnapshotStore::new(self.config.snapshot_dir.clone()),
        );
        writer.backup_day(&ds.symbols, date).await
    }

    /// `days`일보다 오래된 데이터를 삭제합니다.
    pub async fn purge(&self, dataset: Dataset, days: i64) -> Result<u64> {
        if days <= 0 {
            return Err(LoaderError::Config(format!(
                "retention days must be positive, got {}",
                days
            )));
        }
        let cutoff = Utc::now() - Duration::days(days);
        self.loader(dataset)?.purge_before(cutoff).await
    }

    async fn backfill_inner(
        &self,
        dataset: Dataset,
        start: &str,
        end: &str,
        symbol: Option<&str>,
    ) -> Result<BackfillReport> {
        let start = parse_date(start)?;
        let end = parse_date(end)?;
        if start > end {
            return Err(LoaderError::InvalidDate(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        if symbol.is_some() {
            require_symbol_keyed(dataset)?;
        }
        let job = self.job(dataset)?;

        info!(dataset = %dataset, start = %start, end = %end, "Starting backfill");
        let mut report = BackfillReport::default();
        let today = today();

        for date in start.iter_days().take_while(|d| *d <= end) {
            let result = match check_not_today_or_future(date, today) {
                Err(e) => Err(e),
                Ok(()) => match symbol {
                    Some(symbol) => self.load_symbol_on(dataset, date, symbol).await,
                    None => job.run(date).await,
                },
            };

            match result {
                Ok(stats) => {
                    report.stats.merge(&stats);
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(dataset = %dataset, date = %date, error = %e, "Backfill failed for date");
                    report.failed_dates.push(date);
                }
            }
        }

        report.stats.log_summary(&format!("{}_backfill", dataset));
        if !report.failed_dates.is_empty() {
            warn!(
                dataset = %dataset,
                failed = report.failed_dates.len(),
                "Backfill finished with failed dates"
            );
        }
        Ok(report)
    }

    async fn load_symbol_on(
        &self,
        dataset: Dataset,
        date: NaiveDate,
        symbol: &str,
    ) -> Result<LoadStats> {
        let data = self.extractor(dataset)?.extract(date).await?;
        let data = restrict_to_symbol(dataset, data, symbol);
        let stats = self.loader(dataset)?.load(data, date).await?;
        stats.log_summary(&format!("{}_load_{}", dataset, symbol));
        Ok(stats)
    }

    fn extractor(&self, dataset: Dataset) -> Result<&Arc<dyn Extractor>> {
        self.extractors
            .get(&dataset)
            .ok_or_else(|| LoaderError::Config(format!("no extractor for dataset {}", dataset)))
    }
}

/// 배치를 한 심볼로 제한합니다. 없으면 빈 배치를 넣어 복구가 동작하게 합니다.
fn restrict_to_symbol(dataset: Dataset, data: SymbolBatches, symbol: &str) -> SymbolBatches {
    let wanted = dataset.normalize_symbol(symbol);
    let mut restricted: SymbolBatches = data
        .into_iter()
        .filter(|(k, _)| dataset.normalize_symbol(k) == wanted)
        .collect();
    if restricted.is_empty() {
        restricted.insert(symbol.to_string(), TabularBatch::empty());
    }
    restricted
}

fn require_symbol_keyed(dataset: Dataset) -> Result<()> {
    if dataset.is_symbol_keyed() {
        Ok(())
    } else {
        Err(LoaderError::Config(format!(
            "dataset {} has no symbols; only date loads and backfills are supported",
            dataset
        )))
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// 형식을 검증하고, 오늘 또는 미래 날짜를 거부합니다.
pub fn validate_target_date(raw: &str, today: NaiveDate) -> Result<NaiveDate> {
    let date = parse_date(raw)?;
    check_not_today_or_future(date, today)?;
    Ok(date)
}

fn check_not_today_or_future(date: NaiveDate, today: NaiveDate) -> Result<()> {
    if date >= today {
        return Err(LoaderError::InvalidDate(format!(
            "{} cannot be the current date or a future date",
            date.format("%Y%m%d")
        )));
    }
    Ok(())
}
