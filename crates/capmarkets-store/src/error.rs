//! 스토어 모듈 오류 타입.

use thiserror::Error;

/// 스토어 관련 오류.
///
/// 연결성 오류(`ConnectionError`, `Timeout`)만 재시도 대상이며,
/// 나머지는 호출자에게 즉시 전달됩니다.
#[derive(Debug, Error)]
pub enum StoreError {
    /// 일시적 연결 오류 (서버 도달 불가, 연결 끊김)
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// 서버 선택/풀 획득/소켓 타임아웃
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// 재시도를 모두 소진한 뒤의 최종 연결 실패
    #[error("Store connection unavailable after {attempts} attempt(s): {last_error}")]
    ConnectionUnavailable { attempts: u32, last_error: String },

    /// 쿼리 실행 오류
    #[error("Query error: {0}")]
    QueryError(String),

    /// 중복 레코드
    #[error("Duplicate record: {0}")]
    DuplicateError(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// 잘못된 문서 형식
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 잘못된 인자 (컬렉션 이름, 필드 이름 등)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 설정 오류
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StoreError {
    /// 재시도 가능한 일시적 연결성 오류인지 확인.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionError(_) | StoreError::Timeout(_))
    }

    /// 연결 자체를 확보하지 못한 오류인지 확인 (일시적 + 최종 포함).
    pub fn is_connectivity(&self) -> bool {
        self.is_transient() || matches!(self, StoreError::ConnectionUnavailable { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout("connection pool timed out".to_string()),
            sqlx::Error::Io(e) => StoreError::ConnectionError(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::ConnectionError(e.to_string()),
            sqlx::Error::PoolClosed => StoreError::ConnectionError("connection pool closed".to_string()),
            sqlx::Error::WorkerCrashed => {
                StoreError::ConnectionError("connection worker crashed".to_string())
            }
            sqlx::Error::Configuration(e) => StoreError::ConfigError(e.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                if code == "23505" {
                    // PostgreSQL 고유 제약 조건 위반
                    StoreError::DuplicateError(db_err.message().to_string())
                } else if code.starts_with("08") || code == "57P01" {
                    // connection_exception 계열, admin_shutdown
                    StoreError::ConnectionError(db_err.message().to_string())
                } else {
                    StoreError::QueryError(db_err.message().to_string())
                }
            }
            _ => StoreError::QueryError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
