//! 문서 모델과 쿼리 표현.
//!
//! 스토어는 JSON 객체 단위로 데이터를 다룹니다. 시각 값은 고정 폭
//! RFC 3339 UTC 문자열(`YYYY-MM-DDTHH:MM:SSZ`)로 저장하므로 문자열 순서와
//! 시간 순서가 일치합니다.

use crate::error::{Result, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// 저장 단위 문서.
pub type Document = Map<String, Value>;

/// 시각을 저장 형식 문자열로 변환합니다.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 저장 형식(또는 임의의 RFC 3339) 문자열을 UTC 시각으로 파싱합니다.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 단일 필드 조건.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// 값이 정확히 일치
    Eq(Value),
    /// 반열린 시간 구간 `[gte, lt)`
    TimeRange {
        gte: Option<DateTime<Utc>>,
        lt: Option<DateTime<Utc>>,
    },
}

/// 문서 필터. 모든 조건이 AND로 결합됩니다.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    /// 모든 문서와 일치하는 빈 필터.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.into(), Condition::Eq(value.into())));
        self
    }

    /// `start <= field < end` 조건을 추가합니다.
    pub fn time_range(
        mut self,
        field: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        self.conditions.push((
            field.into(),
            Condition::TimeRange {
                gte: Some(start),
                lt: Some(end),
            },
        ));
        self
    }

    /// `field < end` 조건을 추가합니다.
    pub fn before(mut self, field: impl Into<String>, end: DateTime<Utc>) -> Self {
        self.conditions.push((
            field.into(),
            Condition::TimeRange {
                gte: None,
                lt: Some(end),
            },
        ));
        self
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 등호 조건만 모은 문서 (upsert 시 새 문서의 기본 필드).
    pub fn equality_document(&self) -> Document {
        self.conditions
            .iter()
            .filter_map(|(field, cond)| match cond {
                Condition::Eq(v) => Some((field.clone(), v.clone())),
                Condition::TimeRange { .. } => None,
            })
            .collect()
    }

    /// 문서가 필터와 일치하는지 확인합니다.
    ///
    /// 시간 구간 조건은 필드 값이 시각 문자열로 파싱될 때만 일치합니다.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, cond)| match cond {
            Condition::Eq(expected) => doc.get(field) == Some(expected),
            Condition::TimeRange { gte, lt } => {
                let Some(ts) = doc.get(field).and_then(Value::as_str).and_then(parse_timestamp)
                else {
                    return false;
                };
                gte.map_or(true, |start| ts >= start) && lt.map_or(true, |end| ts < end)
            }
        })
    }
}

/// 정렬 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// 조회 옵션.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
    /// 지정 시 해당 필드만 반환
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn sort_desc(field: impl Into<String>) -> Self {
        Self {
            sort: Some((field.into(), SortOrder::Descending)),
            ..Self::default()
        }
    }

    pub fn sort_asc(field: impl Into<String>) -> Self {
        Self {
            sort: Some((field.into(), SortOrder::Ascending)),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// 메모리상의 문서 목록에 정렬/제한/프로젝션을 적용합니다.
    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if let Some((field, order)) = &self.sort {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        if let Some(fields) = &self.projection {
            docs = docs
                .into_iter()
                .map(|doc| {
                    doc.into_iter()
                        .filter(|(k, _)| fields.iter().any(|f| f == k))
                        .collect()
                })
                .collect();
        }
        docs
    }
}

/// `$set` 형식의 갱신.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub upsert: bool,
}

impl Update {
    pub fn set(set: Document) -> Self {
        Self { set, upsert: false }
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    /// 문서에 갱신을 적용하고 실제로 값이 바뀌었는지 반환합니다.
    pub fn apply_to(&self, doc: &mut Document) -> bool {
        let mut changed = false;
        for (k, v) in &self.set {
            if doc.get(k) != Some(v) {
                doc.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }
}

/// 정렬용 값 비교. 없음 < null < bool < 숫자 < 문자열 < 기타.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// 컬렉션/스키마 이름 검증. 영숫자와 `_`만 허용합니다.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidArgument(format!(
            "invalid collection identifier: {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        match v {
            Value::Object(m) => m,
            _ => Document::new(),
        }
    }

    #[test]
    fn test_timestamp_format_is_fixed_width_utc() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 24, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2025-06-24T09:05:00Z");
        assert_eq!(parse_timestamp("2025-06-24T11:05:00+02:00"), Some(ts));
    }

    #[test]
    fn test_filter_matches_symbol_and_day_window() {
        let start = Utc.with_ymd_and_hms(2025, 6, 24, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 25, 0, 0, 0).unwrap();
        let filter = Filter::all()
            .eq("symbol", "BTC")
            .time_range("timestamp", start, end);

        assert!(filter.matches(&doc(json!({"symbol": "BTC", "timestamp": "2025-06-24T00:00:00Z"}))));
        assert!(filter.matches(&doc(json!({"symbol": "BTC", "timestamp": "2025-06-24T23:59:00Z"}))));
        // 구간 끝은 제외
        assert!(!filter.matches(&doc(json!({"symbol": "BTC", "timestamp": "2025-06-25T00:00:00Z"}))));
        assert!(!filter.matches(&doc(json!({"symbol": "ETH", "timestamp": "2025-06-24T10:00:00Z"}))));
        assert!(!filter.matches(&doc(json!({"symbol": "BTC", "timestamp": 12}))));
    }

    #[test]
    fn test_find_options_sort_limit_projection() {
        let docs = vec![
            doc(json!({"t": "2025-06-20T00:00:00Z", "v": 1})),
            doc(json!({"t": "2025-06-22T00:00:00Z", "v": 2})),
            doc(json!({"t": "2025-06-21T00:00:00Z", "v": 3})),
        ];
        let out = FindOptions::sort_desc("t").limit(2).project(&["v"]).apply(docs);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], doc(json!({"v": 2})));
        assert_eq!(out[1], doc(json!({"v": 3})));
    }

    #[test]
    fn test_update_reports_change() {
        let mut d = doc(json!({"a": 1}));
        assert!(!Update::set(doc(json!({"a": 1}))).apply_to(&mut d));
        assert!(Update::set(doc(json!({"a": 2, "b": true}))).apply_to(&mut d));
        assert_eq!(d, doc(json!({"a": 2, "b": true})));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("binanceCryptoData").is_ok());
        assert!(validate_identifier("market_data_1").is_ok());
        assert!(validate_identifier("drop table").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("").is_err());
    }
}
