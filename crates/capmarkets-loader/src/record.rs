//! 시계열 레코드와 추출 배치.
//!
//! 추출기는 심볼별로 [`TabularBatch`](행 = JSON 객체)를 넘기고, 로더는 각 행을
//! [`TimeSeriesRecord`]로 정규화한 뒤 저장 문서로 변환합니다.

use crate::dataset::Dataset;
use crate::error::{LoaderError, Result};
use capmarkets_store::{format_timestamp, parse_timestamp, Document};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 적재 시각 필드 이름.
pub const LOAD_TIMESTAMP_FIELD: &str = "load_timestamp";

/// 스토어 내부 식별자 필드 (복구/스냅샷 시 제거).
const INTERNAL_ID_FIELDS: [&str; 2] = ["_id", "id"];

/// 한 심볼에 대한 추출 결과 테이블.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabularBatch {
    rows: Vec<Document>,
}

impl TabularBatch {
    pub fn new(rows: Vec<Document>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Document] {
        &self.rows
    }

    pub fn push(&mut self, row: Document) {
        self.rows.push(row);
    }
}

impl FromIterator<Document> for TabularBatch {
    fn from_iter<I: IntoIterator<Item = Document>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// 저장 단위 시계열 레코드.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    /// 정규화된 심볼
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// 수치 필드 (open/high/low/close/volume 또는 value)
    pub values: BTreeMap<String, f64>,
    /// 그대로 전달되는 메타데이터 필드
    pub metadata: Document,
    pub load_timestamp: Option<DateTime<Utc>>,
}

impl TimeSeriesRecord {
    /// 추출 행 또는 저장 문서에서 레코드를 만듭니다.
    ///
    /// 행의 심볼 필드는 무시하고 `symbol`(정규화 완료)을 사용합니다.
    pub fn from_row(dataset: Dataset, symbol: &str, row: &Document) -> Result<Self> {
        let time_field = dataset.time_field();
        let raw_time = row.get(time_field).ok_or_else(|| {
            LoaderError::Extract(format!("{} row missing field '{}'", symbol, time_field))
        })?;
        let timestamp = parse_time_value(raw_time).ok_or_else(|| {
            LoaderError::Extract(format!(
                "{} row has unparseable {}: {}",
                symbol, time_field, raw_time
            ))
        })?;

        let mut values = BTreeMap::new();
        for field in dataset.value_fields() {
            match row.get(*field) {
                None | Some(Value::Null) => {}
                Some(raw) => {
                    let value = parse_number(raw).ok_or_else(|| {
                        LoaderError::Extract(format!(
                            "{} row has non-numeric {}: {}",
                            symbol, field, raw
                        ))
                    })?;
                    values.insert(field.to_string(), value);
                }
            }
        }

        let reserved = [dataset.symbol_field(), time_field, LOAD_TIMESTAMP_FIELD];
        let metadata = row
            .iter()
            .filter(|(k, _)| {
                !reserved.contains(&k.as_str())
                    && !INTERNAL_ID_FIELDS.contains(&k.as_str())
                    && !dataset.value_fields().contains(&k.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            symbol: symbol.to_string(),
            timestamp,
            values,
            metadata,
            load_timestamp: None,
        })
    }

    /// 날짜 부분만 `date`로 바꿉니다 (시각은 유지).
    pub fn rewrite_date(&mut self, date: NaiveDate) {
        let time = self.timestamp.time();
        self.timestamp = Utc.from_utc_datetime(&date.and_time(time));
    }

    pub fn stamp(&mut self, at: DateTime<Utc>) {
        self.load_timestamp = Some(at);
    }

    /// 저장 문서로 변환합니다.
    pub fn into_document(self, dataset: Dataset) -> Document {
        let mut doc = self.metadata;
        doc.insert(dataset.symbol_field().to_string(), Value::String(self.symbol));
        doc.insert(
            dataset.time_field().to_string(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        for (field, value) in self.values {
            doc.insert(field, Value::from(value));
        }
        if let Some(at) = self.load_timestamp {
            doc.insert(
                LOAD_TIMESTAMP_FIELD.to_string(),
                Value::String(format_timestamp(&at)),
            );
        }
        doc
    }
}

/// 시각 값 파싱.
///
/// 지원 형식: RFC 3339 문자열, `YYYY-MM-DD[ HH:MM:SS]`, epoch 밀리초 정수,
/// 확장 JSON `{"$date": "..."}` / `{"$date": {"$numberLong": "..."}}`.
pub fn parse_time_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_time_str(raw),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(obj) => {
            let inner = obj.get("$date").or_else(|| obj.get("$numberLong"))?;
            match inner {
                Value::String(raw) if obj.contains_key("$numberLong") => {
                    raw.parse().ok().and_then(DateTime::from_timestamp_millis)
                }
                _ => parse_time_value(inner),
            }
        }
        _ => None,
    }
}

fn parse_time_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Some(ts) = parse_timestamp(raw) {
        return Some(ts);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(obj) => obj
            .get("$numberDouble")
            .or_else(|| obj.get("$numberLong"))
            .or_else(|| obj.get("$numberInt"))
            .and_then(parse_number),
        _ => None,
    }
}

/// `YYYYMMDD` 형식 날짜 파싱.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(LoaderError::InvalidDate(format!(
            "'{}' is not in YYYYMMDD format",
            raw
        )));
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map_err(|e| LoaderError::InvalidDate(format!("'{}': {}", raw, e)))
}

/// 날짜의 UTC 24시간 구간 `[00:00, 다음날 00:00)`.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    (start, start + Duration::days(1))
}
