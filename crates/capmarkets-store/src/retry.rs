//! 스토어 작업 재시도 정책.
//!
//! 일시적 연결성 오류만 지수 백오프로 재시도합니다. 잘못된 문서, 제약 조건
//! 위반 같은 애플리케이션 오류는 지연 없이 바로 반환됩니다.
//!
//! # 지연 스케줄
//!
//! ```text
//! attempt 1 실패 → base_delay
//! attempt 2 실패 → base_delay × multiplier
//! attempt n 실패 → base_delay × multiplier^(n-1)
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 재시도 정책.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 최대 시도 횟수 (첫 시도 포함)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 첫 재시도 전 대기 시간 (밀리초)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 지수 백오프 배수
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// 한 번의 래핑된 호출 동안만 유지되는 재시도 상태.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    current_delay: Duration,
    last_error: Option<String>,
}

impl RetryPolicy {
    /// 새 정책 생성.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            backoff_multiplier,
        }
    }

    /// 재시도 없이 한 번만 시도하는 정책.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// `attempt`번째 시도가 실패한 뒤의 대기 시간.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let secs = self.base_delay().as_secs_f64() * multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// 작업을 재시도 정책으로 감싸 실행합니다.
    ///
    /// 일시적 오류 시 대기 후 `invalidate`를 호출해 호출자의 캐시된 핸들을
    /// 버리게 하고 같은 작업을 다시 실행합니다. 시도가 모두 소진되면
    /// `StoreError::ConnectionUnavailable`을 반환합니다.
    pub async fn with_retry<T, F, Fut, I>(
        &self,
        op_name: &str,
        mut invalidate: I,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        I: FnMut(),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if state.attempt >= max_attempts {
                error!(
                    operation = op_name,
                    attempts = state.attempt,
                    error = %err,
                    "Max retry attempts reached"
                );
                return Err(StoreError::ConnectionUnavailable {
                    attempts: state.attempt,
                    last_error: err.to_string(),
                });
            }

            state.current_delay = self.delay_for(state.attempt);
            warn!(
                operation = op_name,
                attempt = state.attempt,
                max_attempts = max_attempts,
                delay_ms = u64::try_from(state.current_delay.as_millis()).unwrap_or(u64::MAX),
                previous_error = state.last_error.as_deref().unwrap_or("-"),
                error = %err,
                "Connection error, retrying"
            );
            state.last_error = Some(err.to_string());

            tokio::time::sleep(state.current_delay).await;
            invalidate();
        }
    }
}
