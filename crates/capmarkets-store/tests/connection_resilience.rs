//! 연결 복원력 통합 테스트
//!
//! 인메모리 드라이버를 감싸 연결 오류를 주입하고, 팩토리와 커넥터의
//! 재시도/핸들 교체 동작을 확인합니다.

use async_trait::async_trait;
use capmarkets_store::{
    ConnectionFactory, Document, Filter, FindOptions, MemoryDriver, RetryPolicy, Scope,
    StoreConfig, StoreConnector, StoreDriver, StoreError, StoreHandle, Update,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// 작업 실패를 주입하는 드라이버.
///
/// `failing_ops`가 0보다 크면 ping을 제외한 작업이 그 횟수만큼 연결 오류로
/// 실패합니다. `u32::MAX`면 영구 장애.
#[derive(Clone)]
struct FaultyDriver {
    inner: MemoryDriver,
    failing_ops: Arc<AtomicU32>,
    op_calls: Arc<AtomicU32>,
    op_times: Arc<Mutex<Vec<Instant>>>,
}

impl FaultyDriver {
    fn new(failing_ops: u32) -> Self {
        Self {
            inner: MemoryDriver::new(),
            failing_ops: Arc::new(AtomicU32::new(failing_ops)),
            op_calls: Arc::new(AtomicU32::new(0)),
            op_times: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn op_calls(&self) -> u32 {
        self.op_calls.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let times = self.op_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl StoreDriver for FaultyDriver {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn connect(&self, config: &StoreConfig) -> capmarkets_store::Result<Arc<dyn StoreHandle>> {
        let inner = self.inner.connect(config).await?;
        Ok(Arc::new(FaultyHandle {
            inner,
            driver: self.clone(),
        }))
    }
}

struct FaultyHandle {
    inner: Arc<dyn StoreHandle>,
    driver: FaultyDriver,
}

impl FaultyHandle {
    fn trip(&self) -> capmarkets_store::Result<()> {
        self.driver.op_calls.fetch_add(1, Ordering::SeqCst);
        self.driver.op_times.lock().unwrap().push(Instant::now());
        let remaining = self.driver.failing_ops.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != u32::MAX {
            self.driver.failing_ops.fetch_sub(1, Ordering::SeqCst);
        }
        Err(StoreError::ConnectionError("connection reset by peer".into()))
    }
}

#[async_trait]
impl StoreHandle for FaultyHandle {
    async fn ping(&self) -> capmarkets_store::Result<()> {
        self.inner.ping().await
    }

    async fn ensure_collection(&self, collection: &str) -> capmarkets_store::Result<()> {
        self.trip()?;
        self.inner.ensure_collection(collection).await
    }

    async fn insert_many(&self, collection: &str, docs: &[Document]) -> capmarkets_store::Result<u64> {
        self.trip()?;
        self.inner.insert_many(collection, docs).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> capmarkets_store::Result<Vec<Document>> {
        self.trip()?;
        self.inner.find(collection, filter, options).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: Scope,
    ) -> capmarkets_store::Result<u64> {
        self.trip()?;
        self.inner.update(collection, filter, update, scope).await
    }

    async fn delete(&self, collection: &str, filter: &Filter, scope: Scope) -> capmarkets_store::Result<u64> {
        self.trip()?;
        self.inner.delete(collection, filter, scope).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> capmarkets_store::Result<u64> {
        self.trip()?;
        self.inner.count(collection, filter).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

fn connector_over(driver: &FaultyDriver) -> StoreConnector {
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(driver.clone()),
        StoreConfig::in_memory("resilience"),
    ));
    StoreConnector::new(factory, "binanceCryptoData").unwrap()
}

fn candle(symbol: &str, ts: &str) -> Document {
    json!({"symbol": symbol, "timestamp": ts, "close": 100.0})
        .as_object()
        .cloned()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_persistent_outage_fails_after_configured_attempts() {
    let driver = FaultyDriver::new(u32::MAX);
    let connector = connector_over(&driver);

    let err = connector
        .insert_many(&[candle("BTC", "2025-06-24T00:00:00Z")])
        .await
        .unwrap_err();

    assert_eq!(driver.op_calls(), 3);
    match err {
        StoreError::ConnectionUnavailable { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }

    // 지연은 증가해야 함 (1s → 2s)
    let gaps = driver.gaps();
    assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_count_follows_policy() {
    let driver = FaultyDriver::new(u32::MAX);
    let connector = connector_over(&driver)
        .with_policy(RetryPolicy::new(5, Duration::from_millis(100), 3.0));

    let result = connector.count(&Filter::all()).await;

    assert!(matches!(result, Err(StoreError::ConnectionUnavailable { attempts: 5, .. })));
    assert_eq!(driver.op_calls(), 5);
    assert!(driver.gaps().windows(2).all(|w| w[1] > w[0]));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_on_retry() {
    let driver = FaultyDriver::new(1);
    let connector = connector_over(&driver);

    let inserted = connector
        .insert_many(&[
            candle("ETH", "2025-06-20T10:00:00Z"),
            candle("ETH", "2025-06-20T10:01:00Z"),
        ])
        .await
        .unwrap();

    assert_eq!(inserted, 2);
    // 실패 1회 + 성공 1회
    assert_eq!(driver.op_calls(), 2);
    assert_eq!(connector.count(&Filter::all().eq("symbol", "ETH")).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_application_error_is_not_retried() {
    let driver = FaultyDriver::new(0);
    let connector = connector_over(&driver);

    let err = connector
        .get_collection(Some("bad-name"))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert_eq!(driver.op_calls(), 0);
}

#[tokio::test]
async fn test_connectors_share_factory_handle() {
    let driver = FaultyDriver::new(0);
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(driver.clone()),
        StoreConfig::in_memory("shared"),
    ));
    let market = StoreConnector::new(Arc::clone(&factory), "yfinanceMarketData").unwrap();
    let crypto = StoreConnector::new(Arc::clone(&factory), "binanceCryptoData").unwrap();

    market.ensure_connected().await.unwrap();
    crypto.ensure_connected().await.unwrap();

    assert_eq!(market.cached_generation(), crypto.cached_generation());
    assert_eq!(driver.inner.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connectors_single_flight() {
    let driver = FaultyDriver::new(0);
    let factory = Arc::new(ConnectionFactory::new(
        Arc::new(driver.clone()),
        StoreConfig::in_memory("concurrent"),
    ));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let factory = Arc::clone(&factory);
        tasks.push(tokio::spawn(async move {
            let connector = StoreConnector::new(factory, "pyfredapiMacroeconomicIndicators")?;
            connector
                .insert_one(
                    json!({"series_id": format!("S{i}"), "date": "2025-06-24T00:00:00Z"})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                )
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    assert_eq!(driver.inner.connect_count(), 1);
}
