//! 적재/복구 체인 통합 테스트
//!
//! 인메모리 스토어와 임시 스냅샷 디렉터리로 심볼별 적재, 최근 데이터 복구,
//! 스냅샷 복구, 건너뛰기, 연결 실패 전파를 확인합니다.

use async_trait::async_trait;
use capmarkets_loader::record::{day_bounds, parse_time_value};
use capmarkets_loader::{
    Dataset, DatasetLoader, LoaderError, RecoveryLoader, SnapshotStore, SymbolBatches,
    TabularBatch,
};
use capmarkets_store::{
    ConnectionFactory, Document, Filter, FindOptions, MemoryDriver, Scope, StoreConfig,
    StoreDriver, StoreError, StoreHandle, Update,
};
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn crypto_loader(driver: &MemoryDriver, snapshot_dir: &Path) -> DatasetLoader {
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(driver.clone()),
        StoreConfig::in_memory("recovery_chain"),
    ));
    DatasetLoader::from_factory(
        Dataset::CryptoCandles,
        factory,
        Dataset::CryptoCandles.default_collection(),
        SnapshotStore::new(snapshot_dir),
    )
    .unwrap()
}

/// 하루치 1분봉 캔들
fn minute_candles(day: NaiveDate, count: i64) -> TabularBatch {
    let start = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
    (0..count)
        .map(|i| {
            let ts = start + Duration::minutes(i);
            doc(json!({
                "timestamp": ts.to_rfc3339(),
                "open": 100.0 + i as f64,
                "high": 101.0 + i as f64,
                "low": 99.0 + i as f64,
                "close": 100.5 + i as f64,
                "volume": "12.5",
            }))
        })
        .collect()
}

async fn stored_on(loader: &DatasetLoader, symbol: &str, day: NaiveDate) -> Vec<Document> {
    let (start, end) = day_bounds(day);
    loader
        .connector()
        .find(
            &Filter::all()
                .eq("symbol", symbol)
                .time_range("timestamp", start, end),
            &FindOptions::sort_asc("timestamp"),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reload_of_same_day_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());
    let target = date(2025, 6, 24);

    for _ in 0..2 {
        let mut data = SymbolBatches::new();
        data.insert("BTCUSDT".into(), minute_candles(target, 1440));
        let stats = loader.load(data, target).await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.records_written, 1440);
    }

    let docs = stored_on(&loader, "BTC", target).await;
    assert_eq!(docs.len(), 1440);
    assert!(docs.iter().all(|d| d.contains_key("load_timestamp")));
    assert_eq!(docs[0]["volume"], json!(12.5));
    assert_eq!(driver.connect_count(), 1);
}

#[tokio::test]
async fn test_empty_batch_recovers_from_last_stored_day() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());

    let mut earlier = SymbolBatches::new();
    earlier.insert(
        "ETHUSDT".into(),
        TabularBatch::new(vec![
            doc(json!({"timestamp": "2025-06-19T23:00:00Z", "close": 2300.0})),
            doc(json!({"timestamp": "2025-06-20T00:00:00Z", "close": 2400.0})),
            doc(json!({"timestamp": "2025-06-20T12:30:00Z", "close": 2410.0})),
            doc(json!({"timestamp": "2025-06-20T23:59:00Z", "close": 2420.0})),
        ]),
    );
    loader.load(earlier, date(2025, 6, 20)).await.unwrap();

    let mut data = SymbolBatches::new();
    data.insert("ETHUSDT".into(), TabularBatch::empty());
    let stats = loader.load(data, date(2025, 6, 24)).await.unwrap();

    assert_eq!(stats.recovered_live, 1);
    assert_eq!(stats.recovered_snapshot, 0);
    assert_eq!(stats.records_written, 3);

    let recovered = stored_on(&loader, "ETH", date(2025, 6, 24)).await;
    let times: Vec<(u32, u32)> = recovered
        .iter()
        .map(|d| {
            let ts = parse_time_value(&d["timestamp"]).unwrap();
            assert_eq!(ts.date_naive(), date(2025, 6, 24));
            (ts.hour(), ts.minute())
        })
        .collect();
    assert_eq!(times, vec![(0, 0), (12, 30), (23, 59)]);
    assert_eq!(recovered[1]["close"], json!(2410.0));

    // 원본 날짜의 데이터는 그대로 유지
    assert_eq!(stored_on(&loader, "ETH", date(2025, 6, 20)).await.len(), 3);
}

#[tokio::test]
async fn test_reload_keeps_neighbouring_day_rows() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());
    let day = date(2025, 6, 24);
    let next_day = date(2025, 6, 25);

    let mut data = SymbolBatches::new();
    data.insert("BTCUSDT".into(), minute_candles(next_day, 1440));
    loader.load(data, next_day).await.unwrap();

    // 전날 배치 끝에 다음 날 00:00 캔들이 하나 섞여 있음
    let mut rows = minute_candles(day, 1440).rows().to_vec();
    rows.push(doc(json!({"timestamp": "2025-06-25T00:00:00Z", "close": 1.0})));
    let mut data = SymbolBatches::new();
    data.insert("BTCUSDT".into(), TabularBatch::new(rows));
    let stats = loader.load(data, day).await.unwrap();

    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(stored_on(&loader, "BTC", day).await.len(), 1440);
    let next = stored_on(&loader, "BTC", next_day).await;
    assert_eq!(next.len(), 1440);
    assert_eq!(next[0]["close"], json!(1.0));
    assert_eq!(next[1]["close"], json!(101.5));
}

#[tokio::test]
async fn test_store_recovery_leaves_snapshot_unused() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());
    let snapshots = SnapshotStore::new(dir.path());
    snapshots
        .write(
            Dataset::CryptoCandles,
            "SOL",
            &[doc(json!({"symbol": "SOL", "timestamp": "2025-05-01T08:00:00Z", "close": 1.0}))],
        )
        .await
        .unwrap();
    let snapshot_path = snapshots.path_for(Dataset::CryptoCandles, "SOL").unwrap();
    let snapshot_before = std::fs::read_to_string(&snapshot_path).unwrap();

    let mut earlier = SymbolBatches::new();
    earlier.insert(
        "SOLUSDT".into(),
        TabularBatch::new(vec![doc(json!({"timestamp": "2025-06-21T10:00:00Z", "close": 150.0}))]),
    );
    loader.load(earlier, date(2025, 6, 21)).await.unwrap();

    let mut data = SymbolBatches::new();
    data.insert("SOLUSDT".into(), TabularBatch::empty());
    let stats = loader.load(data, date(2025, 6, 24)).await.unwrap();

    assert_eq!(stats.recovered_live, 1);
    assert_eq!(stats.recovered_snapshot, 0);
    let recovered = stored_on(&loader, "SOL", date(2025, 6, 24)).await;
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0]["close"], json!(150.0));
    assert_eq!(
        std::fs::read_to_string(&snapshot_path).unwrap(),
        snapshot_before
    );
}

#[tokio::test]
async fn test_empty_store_recovers_from_snapshot_file() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());
    let path = SnapshotStore::new(dir.path())
        .path_for(Dataset::CryptoCandles, "XRP")
        .unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"[
            {"_id": {"$oid": "6659f0c2"}, "symbol": "XRP",
             "timestamp": {"$date": "2025-06-23T10:00:00Z"}, "close": 2.1},
            {"_id": {"$oid": "6659f0c3"}, "symbol": "XRP",
             "timestamp": {"$date": "2025-06-23T10:01:00Z"}, "close": 2.2}
        ]"#,
    )
    .unwrap();

    let mut data = SymbolBatches::new();
    data.insert("XRPUSDT".into(), TabularBatch::empty());
    let stats = loader.load(data, date(2025, 6, 24)).await.unwrap();

    assert_eq!(stats.recovered_snapshot, 1);
    assert_eq!(stats.records_written, 2);
    let recovered = stored_on(&loader, "XRP", date(2025, 6, 24)).await;
    assert_eq!(recovered.len(), 2);
    // 스토어가 새 `_id`를 부여하며, 스냅샷의 `{"$oid": ...}` 값은 남지 않음
    assert!(recovered
        .iter()
        .all(|d| !matches!(d.get("_id"), Some(serde_json::Value::Object(_)))));
    assert_eq!(
        parse_time_value(&recovered[1]["timestamp"]).unwrap(),
        Utc.with_ymd_and_hms(2025, 6, 24, 10, 1, 0).unwrap()
    );
}

#[tokio::test]
async fn test_unrecoverable_symbol_is_skipped_and_others_continue() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MemoryDriver::new();
    let loader = crypto_loader(&driver, dir.path());
    let target = date(2025, 6, 24);

    let mut data = SymbolBatches::new();
    data.insert("BTCUSDT".into(), minute_candles(target, 10));
    data.insert("DOGEUSDT".into(), TabularBatch::empty());
    data.insert("ETHUSDT".into(), minute_candles(target, 5));
    let stats = loader.load(data, target).await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errors, 0);
    assert!(stored_on(&loader, "DOGE", target).await.is_empty());
    assert_eq!(stored_on(&loader, "ETH", target).await.len(), 5);
}

/// 특정 심볼 문서의 삽입만 실패시키는 드라이버
#[derive(Clone)]
struct RejectingDriver {
    inner: MemoryDriver,
    rejected_symbol: &'static str,
}

#[async_trait]
impl StoreDriver for RejectingDriver {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn connect(&self, config: &StoreConfig) -> capmarkets_store::Result<Arc<dyn StoreHandle>> {
        let inner = self.inner.connect(config).await?;
        Ok(Arc::new(RejectingHandle {
            inner,
            rejected_symbol: self.rejected_symbol,
        }))
    }
}

struct RejectingHandle {
    inner: Arc<dyn StoreHandle>,
    rejected_symbol: &'static str,
}

#[async_trait]
impl StoreHandle for RejectingHandle {
    async fn ping(&self) -> capmarkets_store::Result<()> {
        self.inner.ping().await
    }

    async fn ensure_collection(&self, collection: &str) -> capmarkets_store::Result<()> {
        self.inner.ensure_collection(collection).await
    }

    async fn insert_many(&self, collection: &str, docs: &[Document]) -> capmarkets_store::Result<u64> {
        if docs
            .iter()
            .any(|d| d.get("symbol") == Some(&json!(self.rejected_symbol)))
        {
            return Err(StoreError::QueryError("value too long for column".into()));
        }
        self.inner.insert_many(collection, docs).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> capmarkets_store::Result<Vec<Document>> {
        self.inner.find(collection, filter, options).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: Scope,
    ) -> capmarkets_store::Result<u64> {
        self.inner.update(collection, filter, update, scope).await
    }

    async fn delete(&self, collection: &str, filter: &Filter, scope: Scope) -> capmarkets_store::Result<u64> {
        self.inner.delete(collection, filter, scope).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> capmarkets_store::Result<u64> {
        self.inner.count(collection, filter).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_insert_failure_counts_error_and_others_load() {
    let dir = tempfile::tempdir().unwrap();
    let driver = RejectingDriver {
        inner: MemoryDriver::new(),
        rejected_symbol: "ETH",
    };
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(driver),
        StoreConfig::in_memory("rejecting"),
    ));
    let loader = DatasetLoader::from_factory(
        Dataset::CryptoCandles,
        factory,
        Dataset::CryptoCandles.default_collection(),
        SnapshotStore::new(dir.path()),
    )
    .unwrap();
    let target = date(2025, 6, 24);

    let mut data = SymbolBatches::new();
    data.insert("BTCUSDT".into(), minute_candles(target, 4));
    data.insert("ETHUSDT".into(), minute_candles(target, 4));
    data.insert("SOLUSDT".into(), minute_candles(target, 4));
    let stats = loader.load(data, target).await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.records_written, 8);
    assert_eq!(stored_on(&loader, "BTC", target).await.len(), 4);
    assert!(stored_on(&loader, "ETH", target).await.is_empty());
    assert_eq!(stored_on(&loader, "SOL", target).await.len(), 4);
}

/// 연결을 전혀 수립하지 못하는 드라이버
struct UnreachableDriver;

#[async_trait]
impl StoreDriver for UnreachableDriver {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn connect(&self, _config: &StoreConfig) -> capmarkets_store::Result<Arc<dyn StoreHandle>> {
        Err(StoreError::ConnectionError("no route to host".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_fails_whole_load() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(UnreachableDriver),
        StoreConfig::in_memory("unreachable"),
    ));
    let loader = DatasetLoader::from_factory(
        Dataset::CryptoCandles,
        factory,
        Dataset::CryptoCandles.default_collection(),
        SnapshotStore::new(dir.path()),
    )
    .unwrap();

    let mut data = SymbolBatches::new();
    data.insert("BTCUSDT".into(), minute_candles(date(2025, 6, 24), 3));
    let err = loader.load(data, date(2025, 6, 24)).await.unwrap_err();

    assert!(err.is_systemic());
    assert!(matches!(
        err,
        LoaderError::Store(StoreError::ConnectionUnavailable { .. })
    ));
}
