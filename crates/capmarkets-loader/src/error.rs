//! 에러 타입 정의.

use capmarkets_store::StoreError;
use thiserror::Error;

/// Loader 에러 타입
#[derive(Debug, Error)]
pub enum LoaderError {
    /// 스토어 에러 (연결 불가 포함)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 날짜 검증 실패 (형식 오류, 오늘 또는 미래 날짜)
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// 스냅샷 파일 읽기/쓰기 에러
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// 데이터 추출 에러
    #[error("Extract error: {0}")]
    Extract(String),
}

impl LoaderError {
    /// 스토어 연결 자체가 불가능한 시스템 장애인지 확인
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_connectivity())
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, LoaderError>;
