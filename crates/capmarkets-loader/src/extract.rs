//! 추출기 인터페이스.
//!
//! 실제 데이터 소스(Yahoo Finance, Binance, FRED)별 추출기는 이 crate 밖에
//! 있으며, 로더와는 [`Extractor`] 계약으로만 연결됩니다. 함께 제공되는
//! [`JsonDirExtractor`]는 외부 수집기가 떨어뜨린 JSON 파일을 읽습니다.

use crate::dataset::Dataset;
use crate::error::{LoaderError, Result};
use crate::recovery::SymbolBatches;
use crate::record::TabularBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// 날짜 하나에 대한 심볼별 배치를 만드는 추출기.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn dataset(&self) -> Dataset;

    async fn extract(&self, target_date: NaiveDate) -> Result<SymbolBatches>;
}

/// `<inbox>/<dataset>/<YYYYMMDD>.json` 파일을 읽는 추출기.
///
/// 파일 내용은 `{"BTCUSDT": [{...}, ...], ...}` 형태입니다. 파일이 없거나
/// 설정된 심볼이 파일에 없으면 빈 배치를 넘겨 복구 체인이 동작하게 합니다.
#[derive(Debug, Clone)]
pub struct JsonDirExtractor {
    dataset: Dataset,
    inbox: PathBuf,
    symbols: Vec<String>,
}

impl JsonDirExtractor {
    pub fn new(dataset: Dataset, inbox: impl Into<PathBuf>, symbols: Vec<String>) -> Self {
        Self {
            dataset,
            inbox: inbox.into(),
            symbols,
        }
    }

    pub fn path_for(&self, target_date: NaiveDate) -> PathBuf {
        self.inbox
            .join(self.dataset.as_str())
            .join(format!("{}.json", target_date.format("%Y%m%d")))
    }
}

#[async_trait]
impl Extractor for JsonDirExtractor {
    fn dataset(&self) -> Dataset {
        self.dataset
    }

    async fn extract(&self, target_date: NaiveDate) -> Result<SymbolBatches> {
        let path = self.path_for(target_date);
        let mut batches = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, TabularBatch>>(&raw)
                .map_err(|e| LoaderError::Extract(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    dataset = %self.dataset,
                    path = %path.display(),
                    "No extract file, symbols will go through recovery"
                );
                SymbolBatches::new()
            }
            Err(e) => return Err(LoaderError::Extract(format!("{}: {}", path.display(), e))),
        };

        for symbol in &self.symbols {
            let normalized = self.dataset.normalize_symbol(symbol);
            let present = batches
                .keys()
                .any(|k| self.dataset.normalize_symbol(k) == normalized);
            if !present {
                batches.insert(symbol.clone(), TabularBatch::empty());
            }
        }

        debug!(
            dataset = %self.dataset,
            symbols = batches.len(),
            rows = batches.values().map(TabularBatch::len).sum::<usize>(),
            "Extract finished"
        );
        Ok(batches)
    }
}
