//! 일별 스냅샷 파일.
//!
//! 복구 체인의 마지막 단계에서 읽는 심볼별 백업 파일입니다.
//! 경로는 `<snapshot_dir>/<dataset>/bkp_day_data_<SYMBOL>.json`이며 내용은 하루치
//! 문서의 JSON 배열입니다. 시간 필드는 확장 JSON(`{"$date": ...}`)으로 기록하고,
//! 읽을 때는 일반 문자열과 확장 JSON을 모두 받습니다.

use crate::dataset::Dataset;
use crate::error::{LoaderError, Result};
use crate::record::{day_bounds, parse_time_value};
use capmarkets_store::{format_timestamp, Document, Filter, FindOptions, StoreConnector};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 스냅샷 파일 디렉터리.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 심볼의 스냅샷 파일 경로 (`symbol`은 정규화된 값).
    ///
    /// 파일 이름에 쓸 수 없는 심볼(경로 구분자, `..` 등)은 거부합니다.
    pub fn path_for(&self, dataset: Dataset, symbol: &str) -> Result<PathBuf> {
        if !is_safe_file_symbol(symbol) {
            return Err(LoaderError::Snapshot(format!(
                "invalid symbol for snapshot file name: {:?}",
                symbol
            )));
        }
        Ok(self
            .root
            .join(dataset.as_str())
            .join(format!("bkp_day_data_{}.json", symbol)))
    }

    /// 스냅샷 문서를 읽습니다. 파일이 없으면 빈 목록입니다.
    pub async fn read(&self, dataset: Dataset, symbol: &str) -> Result<Vec<Document>> {
        let path = self.path_for(dataset, symbol)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(symbol = %symbol, path = %path.display(), "No snapshot file found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            LoaderError::Snapshot(format!("{}: {}", path.display(), e))
        })?;
        let Value::Array(items) = parsed else {
            return Err(LoaderError::Snapshot(format!(
                "{}: expected a JSON array",
                path.display()
            )));
        };

        let docs = items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(mut doc) => {
                    doc.remove("_id");
                    doc.remove("id");
                    Some(doc)
                }
                _ => None,
            })
            .collect();
        Ok(docs)
    }

    /// 스냅샷 파일을 교체합니다.
    pub async fn write(
        &self,
        dataset: Dataset,
        symbol: &str,
        docs: &[Document],
    ) -> Result<PathBuf> {
        let path = self.path_for(dataset, symbol)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "Previous snapshot file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let time_field = dataset.time_field();
        let items: Vec<Value> = docs
            .iter()
            .map(|doc| {
                let mut doc = doc.clone();
                doc.remove("_id");
                doc.remove("id");
                if let Some(ts) = doc.get(time_field).and_then(parse_time_value) {
                    doc.insert(
                        time_field.to_string(),
                        json!({ "$date": format_timestamp(&ts) }),
                    );
                }
                Value::Object(doc)
            })
            .collect();

        tokio::fs::write(&path, serde_json::to_string_pretty(&items)?).await?;
        Ok(path)
    }
}

/// 영숫자와 `-_=.`만 허용하며 `.`으로 시작할 수 없습니다.
fn is_safe_file_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && !symbol.starts_with('.')
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.'))
}

/// 스토어의 하루치 데이터를 스냅샷 파일로 백업합니다.
pub struct SnapshotWriter {
    dataset: Dataset,
    connector: StoreConnector,
    snapshots: SnapshotStore,
}

impl SnapshotWriter {
    pub fn new(dataset: Dataset, connector: StoreConnector, snapshots: SnapshotStore) -> Self {
        Self {
            dataset,
            connector,
            snapshots,
        }
    }

    /// 심볼별로 `date`의 문서를 조회해 파일을 교체합니다.
    ///
    /// 백업된 문서 수의 합을 반환합니다. 한 심볼의 실패는 기록 후 건너뜁니다.
    pub async fn backup_day(&self, symbols: &[String], date: NaiveDate) -> Result<usize> {
        let (start, end) = day_bounds(date);
        let mut total = 0;

        for raw in symbols {
            let symbol = self.dataset.normalize_symbol(raw);
            if let Err(e) = self.snapshots.path_for(self.dataset, &symbol) {
                warn!(symbol = %symbol, error = %e, "Skipping symbol with unusable snapshot name");
                continue;
            }
            let filter = Filter::all()
                .eq(self.dataset.symbol_field(), symbol.as_str())
                .time_range(self.dataset.time_field(), start, end);
            let docs = match self
                .connector
                .find(&filter, &FindOptions::sort_asc(self.dataset.time_field()))
                .await
            {
                Ok(docs) => docs,
                Err(e) if e.is_connectivity() => return Err(e.into()),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Snapshot query failed, skipping symbol");
                    continue;
                }
            };

            let path = self.snapshots.write(self.dataset, &symbol, &docs).await?;
            info!(
                dataset = %self.dataset,
                symbol = %symbol,
                date = %date,
                documents = docs.len(),
                path = %path.display(),
                "Snapshot written"
            );
            total += docs.len();
        }
        Ok(total)
    }
}
