//! 프로세스 전역 연결 팩토리.
//!
//! 하나의 공유 핸들을 지연 생성하고, TTL이 지나거나 헬스 체크에 실패하면
//! 교체합니다. 스케줄러 루프와 동시 요청들이 같은 팩토리를 `Arc`로 공유합니다.
//!
//! # 핸들 획득 흐름
//!
//! ```text
//! get_handle ──[캐시 있음 & TTL 이내 & ping 성공]──> 캐시 반환 (fast path)
//!     │
//!     └──> create_lock 획득 ──[재확인 성공]──> 캐시 반환
//!                │
//!                └──> 이전 핸들 close ──> establish (지수 백오프, max_wait 이내)
//!                                             │
//!                                             └──> 캐시 저장 후 반환
//! ```
//!
//! 생성 경로는 `create_lock`으로 직렬화되므로 동시에 여러 호출이 들어와도
//! 연결 수립은 한 번만 일어납니다 (single-flight).

use crate::config::StoreConfig;
use crate::driver::{driver_for, StoreDriver, StoreHandle};
use crate::error::{Result, StoreError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// 핸들에 기록되는 풀/타임아웃 한도.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleLimits {
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connect_timeout: Duration,
    pub select_timeout: Duration,
    pub socket_timeout: Duration,
}

impl HandleLimits {
    fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_pool_size: config.max_pool_size,
            min_pool_size: config.min_pool_size,
            connect_timeout: config.connect_timeout(),
            select_timeout: config.select_timeout(),
            socket_timeout: config.socket_timeout(),
        }
    }
}

/// 스토어에 대한 공유 핸들.
///
/// 복제 비용이 낮으며, 복제본들은 같은 연결과 같은 헬스 플래그를 공유합니다.
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: u64,
    created_at: Instant,
    ttl: Duration,
    limits: HandleLimits,
    healthy: Arc<AtomicBool>,
    store: Arc<dyn StoreHandle>,
}

impl ConnectionHandle {
    /// 프로세스 내에서 유일한 핸들 세대 번호.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// TTL이 지났는지 확인.
    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }

    pub fn limits(&self) -> HandleLimits {
        self.limits
    }

    /// 마지막 헬스 체크 결과.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// 스토어 작업에 사용하는 연결.
    pub fn store(&self) -> &Arc<dyn StoreHandle> {
        &self.store
    }

    /// 짧은 타임아웃으로 생존을 확인하고 헬스 플래그를 갱신합니다.
    pub async fn check_liveness(&self, timeout: Duration) -> Result<()> {
        let result = match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "ping timed out after {}ms",
                timeout.as_millis()
            ))),
        };
        self.healthy.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// 같은 연결을 가리키는지 확인.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("age", &self.age())
            .field("ttl", &self.ttl)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// 공유 핸들의 생성/검증/교체를 담당하는 팩토리.
pub struct ConnectionFactory {
    driver: Arc<dyn StoreDriver>,
    config: StoreConfig,
    /// 캐시 슬롯. 복제/교체할 때만 잠깐 잡으며 await 중에는 잡지 않음
    cached: RwLock<Option<ConnectionHandle>>,
    /// 생성 경로 직렬화
    create_lock: Mutex<()>,
    generations: AtomicU64,
}

impl ConnectionFactory {
    /// 드라이버와 설정으로 팩토리를 만듭니다. 연결은 첫 요청 때 수립됩니다.
    pub fn new(driver: Arc<dyn StoreDriver>, config: StoreConfig) -> Self {
        Self {
            driver,
            config,
            cached: RwLock::new(None),
            create_lock: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    /// URI 스킴으로 드라이버를 골라 팩토리를 만듭니다.
    pub fn from_config(config: StoreConfig) -> Result<Self> {
        let driver = driver_for(&config)?;
        Ok(Self::new(driver, config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 현재 캐시된 핸들의 세대 번호.
    pub fn cached_generation(&self) -> Option<u64> {
        self.read_cached().map(|h| h.generation)
    }

    /// 건강한 핸들을 반환합니다.
    ///
    /// `max_wait` 안에 핸들을 만들지 못하면 `ConnectionUnavailable`을 반환합니다.
    pub async fn get_handle(&self, max_wait: Duration) -> Result<ConnectionHandle> {
        // fast path: 생성 잠금 없이 캐시 확인
        if let Some(handle) = self.fresh_cached() {
            if self.check_health(&handle).await {
                return Ok(handle);
            }
        }

        let _guard = self.create_lock.lock().await;

        // 다른 호출이 방금 교체했을 수 있으므로 재확인
        if let Some(handle) = self.fresh_cached() {
            if self.check_health(&handle).await {
                return Ok(handle);
            }
        }

        let stale = self.write_cached().take();
        if let Some(stale) = stale {
            info!(generation = stale.generation, "Closing stale store handle");
            stale.store.close().await;
        }

        let handle = self.establish(max_wait).await?;
        *self.write_cached() = Some(handle.clone());
        Ok(handle)
    }

    /// 캐시된 핸들을 닫고 비웁니다 (종료 시, 테스트 격리용).
    pub async fn close(&self) {
        let _guard = self.create_lock.lock().await;
        let cached = self.write_cached().take();
        if let Some(handle) = cached {
            handle.store.close().await;
            info!(generation = handle.generation, "Closed cached store handle");
        }
    }

    /// 헬스 체크. 실패는 경고로 기록합니다.
    pub async fn check_health(&self, handle: &ConnectionHandle) -> bool {
        match handle.check_liveness(self.config.ping_timeout()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    generation = handle.generation,
                    error = %e,
                    "Cached store handle is unhealthy, will create new handle"
                );
                false
            }
        }
    }

    /// 지수 백오프로 새 핸들을 수립합니다.
    async fn establish(&self, max_wait: Duration) -> Result<ConnectionHandle> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            // 시도 하나가 남은 예산을 넘지 않도록 제한
            let remaining = max_wait.saturating_sub(started.elapsed());
            let outcome = match tokio::time::timeout(remaining, self.try_establish()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StoreError::Timeout(format!(
                    "connect attempt timed out after {}ms",
                    remaining.as_millis()
                ))),
            };
            let err = match outcome {
                Ok(handle) => {
                    info!(
                        driver = self.driver.name(),
                        generation = handle.generation,
                        attempt = attempt,
                        "Store handle established"
                    );
                    return Ok(handle);
                }
                Err(e) => e,
            };

            // 설정 오류는 기다려도 해결되지 않음
            if matches!(err, StoreError::ConfigError(_) | StoreError::InvalidArgument(_)) {
                error!(error = %err, "Store handle cannot be created");
                return Err(err);
            }

            let wait = self.establish_backoff(attempt);
            if started.elapsed() + wait < max_wait {
                warn!(
                    attempt = attempt,
                    retry_in_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Failed to connect to store, retrying"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            error!(
                attempts = attempt,
                max_wait_secs = max_wait.as_secs_f64(),
                error = %err,
                "Failed to connect to store within retry window"
            );
            return Err(StoreError::ConnectionUnavailable {
                attempts: attempt,
                last_error: err.to_string(),
            });
        }
    }

    /// 연결 한 번 + 생존 확인 한 번.
    async fn try_establish(&self) -> Result<ConnectionHandle> {
        let store = self.driver.connect(&self.config).await?;
        let handle = ConnectionHandle {
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
            created_at: Instant::now(),
            ttl: self.config.handle_ttl(),
            limits: HandleLimits::from_config(&self.config),
            healthy: Arc::new(AtomicBool::new(false)),
            store,
        };
        if let Err(e) = handle.check_liveness(self.config.ping_timeout()).await {
            handle.store.close().await;
            return Err(e);
        }
        Ok(handle)
    }

    /// `min(cap, base × 2^(attempt-1))`
    fn establish_backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.establish_backoff_ms);
        let cap = Duration::from_millis(self.config.establish_backoff_cap_ms);
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(cap).min(cap)
    }

    fn fresh_cached(&self) -> Option<ConnectionHandle> {
        self.read_cached().filter(|h| !h.is_expired())
    }

    fn read_cached(&self) -> Option<ConnectionHandle> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write_cached(&self) -> std::sync::RwLockWriteGuard<'_, Option<ConnectionHandle>> {
        self.cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
