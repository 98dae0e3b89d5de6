//! 복구 기능이 있는 로더.
//!
//! 심볼별 배치를 받아 저장하며, 추출 결과가 비어 있으면 복구 체인을 따릅니다.
//!
//! ```text
//! 배치 있음 ──> 대상 날짜 구간 삭제 ──> 삽입
//! 배치 비어 있음
//!   └─> 1단계: 스토어의 마지막 날 데이터 ──[있음]──> 날짜를 대상 날짜로 바꿔 삽입
//!         └─[없음]─> 2단계: 스냅샷 파일 ──[있음]──> 날짜를 바꿔 삽입
//!                      └─[없음]─> 에러 기록 후 건너뜀
//! ```
//!
//! 한 심볼의 실패는 다른 심볼에 영향을 주지 않습니다. `load` 시작 시 스토어
//! 연결을 확보하지 못한 경우에만 에러를 반환합니다.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::record::{day_bounds, parse_time_value, TabularBatch, TimeSeriesRecord};
use crate::snapshot::SnapshotStore;
use crate::stats::LoadStats;
use async_trait::async_trait;
use capmarkets_store::{
    format_timestamp, ConnectionFactory, Document, Filter, FindOptions, StoreConnector,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// 심볼 → 배치. 순서가 고정되도록 `BTreeMap`을 사용합니다.
pub type SymbolBatches = BTreeMap<String, TabularBatch>;

/// 복구 데이터의 출처.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// 스토어에 남아 있는 마지막 날 데이터
    LiveStore,
    /// 심볼별 스냅샷 파일
    SnapshotFile,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LiveStore => write!(f, "live_store"),
            Self::SnapshotFile => write!(f, "snapshot_file"),
        }
    }
}

/// 심볼 하나의 처리 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOutcome {
    /// 추출 데이터를 덮어써서 저장
    Inserted { written: u64, deleted: u64 },
    /// 복구 데이터를 저장
    Recovered { source: RecoverySource, written: u64 },
    /// 대상 날짜 데이터가 이미 있어 그대로 둠
    Unchanged,
    /// 복구 소스가 모두 비어 있음
    Skipped,
}

/// 복구 체인을 갖춘 로더 인터페이스.
#[async_trait]
pub trait RecoveryLoader: Send + Sync {
    fn dataset(&self) -> Dataset;

    /// 심볼별 배치를 `target_date` 기준으로 저장합니다.
    async fn load(&self, data: SymbolBatches, target_date: NaiveDate) -> Result<LoadStats>;

    /// 심볼의 `date` 하루치 문서를 삭제하고 삭제 개수를 반환합니다.
    async fn delete_existing(&self, symbol: &str, date: NaiveDate) -> Result<u64>;

    /// `cutoff` 이전 문서를 모두 삭제합니다 (보존 기간 정리).
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 데이터셋 하나에 대한 로더.
pub struct DatasetLoader {
    dataset: Dataset,
    connector: StoreConnector,
    snapshots: SnapshotStore,
}

impl DatasetLoader {
    pub fn new(dataset: Dataset, connector: StoreConnector, snapshots: SnapshotStore) -> Self {
        Self {
            dataset,
            connector,
            snapshots,
        }
    }

    /// 공유 팩토리 위에 로더를 만듭니다.
    pub fn from_factory(
        dataset: Dataset,
        factory: Arc<ConnectionFactory>,
        collection: &str,
        snapshots: SnapshotStore,
    ) -> Result<Self> {
        let connector = StoreConnector::new(factory, collection)?;
        Ok(Self::new(dataset, connector, snapshots))
    }

    pub fn connector(&self) -> &StoreConnector {
        &self.connector
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// 심볼 하나를 처리합니다. `symbol`은 정규화된 값입니다.
    async fn load_symbol(
        &self,
        symbol: &str,
        batch: &TabularBatch,
        target_date: NaiveDate,
    ) -> Result<SymbolOutcome> {
        if !batch.is_empty() {
            return self.overwrite(symbol, batch, target_date).await;
        }

        warn!(
            dataset = %self.dataset,
            symbol = %symbol,
            target_date = %target_date,
            "No new data, attempting recovery from store"
        );
        if let Some(outcome) = self.recover_from_store(symbol, target_date).await? {
            return Ok(outcome);
        }

        warn!(
            dataset = %self.dataset,
            symbol = %symbol,
            "Recovery from store failed, attempting recovery from snapshot"
        );
        if let Some(outcome) = self.recover_from_snapshot(symbol, target_date).await? {
            return Ok(outcome);
        }

        error!(
            dataset = %self.dataset,
            symbol = %symbol,
            target_date = %target_date,
            "Recovery from snapshot failed, skipping symbol"
        );
        Ok(SymbolOutcome::Skipped)
    }

    /// 대상 날짜 하루치를 지우고 배치를 삽입합니다.
    ///
    /// 대상 날짜 밖의 행은 같은 `(심볼, 시각)` 문서만 지우므로 이웃 날짜의
    /// 나머지 데이터는 그대로 남습니다.
    async fn overwrite(
        &self,
        symbol: &str,
        batch: &TabularBatch,
        target_date: NaiveDate,
    ) -> Result<SymbolOutcome> {
        let mut records = self.to_records(symbol, batch.rows())?;
        let now = Utc::now();
        records.iter_mut().for_each(|r| r.stamp(now));

        let (start, end) = day_bounds(target_date);
        let mut deleted = self.delete_window(symbol, start, end).await?;

        let stray: BTreeSet<DateTime<Utc>> = records
            .iter()
            .map(|r| r.timestamp)
            .filter(|ts| *ts < start || *ts >= end)
            .collect();
        for ts in &stray {
            deleted += self.delete_at(symbol, ts).await?;
        }
        if !stray.is_empty() {
            debug!(
                symbol = %symbol,
                target_date = %target_date,
                rows = stray.len(),
                "Batch rows outside target date replaced by exact key"
            );
        }

        let docs = self.to_documents(records);
        let written = self.connector.insert_many(&docs).await?;

        info!(
            dataset = %self.dataset,
            symbol = %symbol,
            target_date = %target_date,
            deleted = deleted,
            inserted = written,
            "Inserted documents"
        );
        Ok(SymbolOutcome::Inserted { written, deleted })
    }

    /// 1단계: 스토어의 가장 최근 날짜 데이터를 대상 날짜로 복사합니다.
    async fn recover_from_store(
        &self,
        symbol: &str,
        target_date: NaiveDate,
    ) -> Result<Option<SymbolOutcome>> {
        let time_field = self.dataset.time_field();
        let newest = self
            .connector
            .find_one(&self.symbol_filter(symbol), FindOptions::sort_desc(time_field))
            .await?;
        let Some(newest) = newest else {
            warn!(symbol = %symbol, "No previous data found in store");
            return Ok(None);
        };
        let Some(last_ts) = newest.get(time_field).and_then(parse_time_value) else {
            warn!(symbol = %symbol, "Newest document has no readable time field");
            return Ok(None);
        };
        let last_day = last_ts.date_naive();

        if last_day == target_date || self.has_data_on(symbol, target_date).await? {
            info!(
                symbol = %symbol,
                target_date = %target_date,
                "Data for target date already stored, keeping existing documents"
            );
            return Ok(Some(SymbolOutcome::Unchanged));
        }

        let (start, end) = day_bounds(last_day);
        let filter = self
            .symbol_filter(symbol)
            .time_range(time_field, start, end);
        let docs = self
            .connector
            .find(&filter, &FindOptions::sort_asc(time_field))
            .await?;
        if docs.is_empty() {
            warn!(symbol = %symbol, last_day = %last_day, "No documents found on last available day");
            return Ok(None);
        }

        let written = self.insert_recovered(symbol, &docs, target_date).await?;
        info!(
            symbol = %symbol,
            source = %RecoverySource::LiveStore,
            last_day = %last_day,
            target_date = %target_date,
            recovered = written,
            "Recovered documents from last available day"
        );
        Ok(Some(SymbolOutcome::Recovered {
            source: RecoverySource::LiveStore,
            written,
        }))
    }

    /// 2단계: 스냅샷 파일의 데이터를 대상 날짜로 복사합니다.
    async fn recover_from_snapshot(
        &self,
        symbol: &str,
        target_date: NaiveDate,
    ) -> Result<Option<SymbolOutcome>> {
        let docs = self.snapshots.read(self.dataset, symbol).await?;
        if docs.is_empty() {
            return Ok(None);
        }

        let written = self.insert_recovered(symbol, &docs, target_date).await?;
        info!(
            symbol = %symbol,
            source = %RecoverySource::SnapshotFile,
            target_date = %target_date,
            recovered = written,
            "Recovered documents from snapshot"
        );
        Ok(Some(SymbolOutcome::Recovered {
            source: RecoverySource::SnapshotFile,
            written,
        }))
    }

    async fn insert_recovered(
        &self,
        symbol: &str,
        docs: &[Document],
        target_date: NaiveDate,
    ) -> Result<u64> {
        let mut records = self.to_records(symbol, docs)?;
        let now = Utc::now();
        for record in &mut records {
            record.rewrite_date(target_date);
            record.stamp(now);
        }
        let docs = self.to_documents(records);
        Ok(self.connector.insert_many(&docs).await?)
    }

    async fn has_data_on(&self, symbol: &str, date: NaiveDate) -> Result<bool> {
        let (start, end) = day_bounds(date);
        let filter = self
            .symbol_filter(symbol)
            .time_range(self.dataset.time_field(), start, end);
        Ok(self.connector.count(&filter).await? > 0)
    }

    async fn delete_window(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let filter = self
            .symbol_filter(symbol)
            .time_range(self.dataset.time_field(), start, end);
        let deleted = self.connector.delete_many(&filter).await?;
        debug!(
            symbol = %symbol,
            start = %start,
            end = %end,
            deleted = deleted,
            "Deleted existing documents"
        );
        Ok(deleted)
    }

    async fn delete_at(&self, symbol: &str, ts: &DateTime<Utc>) -> Result<u64> {
        let filter = self
            .symbol_filter(symbol)
            .eq(self.dataset.time_field(), format_timestamp(ts));
        Ok(self.connector.delete_many(&filter).await?)
    }

    fn symbol_filter(&self, symbol: &str) -> Filter {
        Filter::all().eq(self.dataset.symbol_field(), symbol)
    }

    fn to_records(&self, symbol: &str, rows: &[Document]) -> Result<Vec<TimeSeriesRecord>> {
        rows.iter()
            .map(|row| TimeSeriesRecord::from_row(self.dataset, symbol, row))
            .collect()
    }

    fn to_documents(&self, records: Vec<TimeSeriesRecord>) -> Vec<Document> {
        records
            .into_iter()
            .map(|r| r.into_document(self.dataset))
            .collect()
    }
}

#[async_trait]
impl RecoveryLoader for DatasetLoader {
    fn dataset(&self) -> Dataset {
        self.dataset
    }

    #[instrument(skip(self, data), fields(dataset = %self.dataset, symbols = data.len()))]
    async fn load(&self, data: SymbolBatches, target_date: NaiveDate) -> Result<LoadStats> {
        let started = std::time::Instant::now();
        info!(target_date = %target_date, "Loading data");

        // 연결 자체가 불가능하면 심볼별 처리로 넘어가지 않음
        self.connector.ensure_connected().await?;

        let mut stats = LoadStats::new();
        for (raw_symbol, batch) in &data {
            let symbol = self.dataset.normalize_symbol(raw_symbol);
            stats.total += 1;

            match self.load_symbol(&symbol, batch, target_date).await {
                Ok(SymbolOutcome::Inserted { written, deleted }) => {
                    stats.inserted += 1;
                    stats.records_written += written;
                    stats.records_deleted += deleted;
                }
                Ok(SymbolOutcome::Recovered { source, written }) => {
                    match source {
                        RecoverySource::LiveStore => stats.recovered_live += 1,
                        RecoverySource::SnapshotFile => stats.recovered_snapshot += 1,
                    }
                    stats.records_written += written;
                }
                Ok(SymbolOutcome::Unchanged) => stats.unchanged += 1,
                Ok(SymbolOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    stats.errors += 1;
                    error!(
                        symbol = %symbol,
                        error = %e,
                        "Error loading data for symbol"
                    );
                }
            }
        }

        stats.elapsed = started.elapsed();
        Ok(stats)
    }

    async fn delete_existing(&self, symbol: &str, date: NaiveDate) -> Result<u64> {
        let symbol = self.dataset.normalize_symbol(symbol);
        let (start, end) = day_bounds(date);
        let deleted = self.delete_window(&symbol, start, end).await?;
        info!(
            symbol = %symbol,
            date = %date,
            deleted = deleted,
            "Deleted documents for symbol on date"
        );
        Ok(deleted)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let filter = Filter::all().before(self.dataset.time_field(), cutoff);
        let deleted = self.connector.delete_many(&filter).await?;
        info!(
            dataset = %self.dataset,
            collection = %self.connector.collection(),
            cutoff = %cutoff,
            deleted = deleted,
            "Purged documents older than cutoff"
        );
        Ok(deleted)
    }
}
