//! Capital-markets ingestion loader.
//!
//! 외부 수집기가 추출한 시계열 배치를 스토어에 적재하는 crate입니다:
//! - 시장 데이터 분봉 (Yahoo Finance)
//! - 암호화폐 분봉 (Binance)
//! - 거시경제 지표 (FRED)
//! - 포트폴리오 일간/누적 수익률
//!
//! 심볼 배치가 비어 있으면 최근 저장 데이터 → 스냅샷 파일 순서로 복구합니다.
//! 포트폴리오 성과는 날짜마다 한 번만 삽입합니다.

pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod job;
pub mod portfolio;
pub mod record;
pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod stats;

pub use config::{DatasetConfig, LoaderConfig, ScheduleConfig};
pub use dataset::Dataset;
pub use error::{LoaderError, Result};
pub use extract::{Extractor, JsonDirExtractor};
pub use job::{EtlJob, Job};
pub use portfolio::{
    InsertOutcome, PerformanceRecord, PortfolioJob, PortfolioPerformanceLoader, RandomWalkReturns,
    ReturnModel,
};
pub use record::{TabularBatch, TimeSeriesRecord};
pub use recovery::{DatasetLoader, RecoveryLoader, RecoverySource, SymbolBatches, SymbolOutcome};
pub use scheduler::{ScheduledJob, Scheduler};
pub use service::{BackfillReport, LoaderService};
pub use snapshot::{SnapshotStore, SnapshotWriter};
pub use stats::LoadStats;
