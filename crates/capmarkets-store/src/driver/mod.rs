//! 스토어 드라이버.
//!
//! 드라이버는 새 연결을 수립하고, 연결(`StoreHandle`)은 컬렉션 단위의 CRUD를
//! 제공합니다. 연결 캐싱, 헬스 체크, 재시도는 드라이버가 아니라
//! [`ConnectionFactory`](crate::ConnectionFactory)와
//! [`StoreConnector`](crate::StoreConnector)의 책임입니다.

pub mod memory;
pub mod postgres;

use crate::config::StoreConfig;
use crate::document::{Document, Filter, FindOptions, Update};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::{MemoryDriver, MemoryHandle};
pub use postgres::{PostgresDriver, PostgresHandle};

/// 갱신/삭제 대상 범위.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    One,
    Many,
}

/// 스토어에 대한 살아있는 연결.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// 가벼운 생존 확인. 타임아웃은 호출자가 적용합니다.
    async fn ping(&self) -> Result<()>;

    /// 컬렉션이 없으면 생성합니다.
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// 문서를 삽입하고 삽입된 개수를 반환합니다.
    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    /// 실제로 변경된 문서 수를 반환합니다.
    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: Scope,
    ) -> Result<u64>;

    /// 삭제된 문서 수를 반환합니다.
    async fn delete(&self, collection: &str, filter: &Filter, scope: Scope) -> Result<u64>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// 연결 자원을 해제합니다. 이후 모든 작업은 연결 오류를 반환합니다.
    async fn close(&self);
}

/// 새 연결을 수립하는 드라이버.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// 로깅용 드라이버 이름.
    fn name(&self) -> &str;

    /// 연결을 한 번 시도합니다. 재시도는 호출자가 담당합니다.
    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn StoreHandle>>;
}

const SUPPORTED_SCHEMES: [&str; 3] = ["postgres://", "postgresql://", "memory://"];

/// URI 스킴에 맞는 드라이버를 선택합니다.
pub fn driver_for(config: &StoreConfig) -> Result<Arc<dyn StoreDriver>> {
    let (uri, _) = config.require_target()?;
    if uri.starts_with("memory://") {
        Ok(Arc::new(MemoryDriver::new()))
    } else if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
        Ok(Arc::new(PostgresDriver))
    } else {
        Err(StoreError::ConfigError(format!(
            "unsupported store URI scheme '{}' (supported: {})",
            uri.split("://").next().unwrap_or(uri),
            SUPPORTED_SCHEMES.join(", ")
        )))
    }
}
