//! 문서 스토어 접근 계층.
//!
//! 이 crate는 다음을 제공합니다:
//! - 프로세스 전역 연결 팩토리 (TTL, 헬스 체크, single-flight 생성)
//! - 일시적 연결 오류에 대한 재시도 정책
//! - 컬렉션 단위 커넥터 (CRUD + 재시도)
//! - 스토어 드라이버 (PostgreSQL JSONB, 인메모리)

pub mod config;
pub mod connector;
pub mod document;
pub mod driver;
pub mod error;
pub mod factory;
pub mod retry;

pub use config::StoreConfig;
pub use connector::{CollectionRef, StoreConnector};
pub use document::{
    format_timestamp, parse_timestamp, Condition, Document, Filter, FindOptions, SortOrder, Update,
};
pub use driver::{driver_for, MemoryDriver, PostgresDriver, Scope, StoreDriver, StoreHandle};
pub use error::{Result, StoreError};
pub use factory::{ConnectionFactory, ConnectionHandle, HandleLimits};
pub use retry::RetryPolicy;
