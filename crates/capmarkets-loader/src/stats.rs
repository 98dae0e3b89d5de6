//! 적재 통계 구조체.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `load()` 한 번의 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadStats {
    /// 처리한 심볼 수
    pub total: usize,
    /// 추출 데이터로 적재된 심볼 수
    pub inserted: usize,
    /// 라이브 스토어에서 복구된 심볼 수
    pub recovered_live: usize,
    /// 스냅샷 파일에서 복구된 심볼 수
    pub recovered_snapshot: usize,
    /// 대상 날짜 데이터가 이미 있어 그대로 둔 항목 수
    pub unchanged: usize,
    /// 복구 소스가 없어 건너뛴 심볼 수
    pub skipped: usize,
    /// 에러로 건너뛴 심볼 수
    pub errors: usize,
    /// 기록된 문서 수
    pub records_written: u64,
    /// 삭제된 문서 수 (덮어쓰기 구간)
    pub records_deleted: u64,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl LoadStats {
    /// 새 통계 객체 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터가 기록된 심볼 수
    pub fn loaded(&self) -> usize {
        self.inserted + self.recovered_live + self.recovered_snapshot
    }

    /// 성공률 계산 (%). 이미 적재되어 있던 항목도 성공으로 칩니다.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((self.loaded() + self.unchanged) as f64 / self.total as f64) * 100.0
        }
    }

    /// 다른 통계를 합산 (backfill 누적용)
    pub fn merge(&mut self, other: &LoadStats) {
        self.total += other.total;
        self.inserted += other.inserted;
        self.recovered_live += other.recovered_live;
        self.recovered_snapshot += other.recovered_snapshot;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.records_written += other.records_written;
        self.records_deleted += other.records_deleted;
        self.elapsed += other.elapsed;
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            total = self.total,
            inserted = self.inserted,
            recovered_live = self.recovered_live,
            recovered_snapshot = self.recovered_snapshot,
            unchanged = self.unchanged,
            skipped = self.skipped,
            errors = self.errors,
            records_written = self.records_written,
            records_deleted = self.records_deleted,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "적재 완료"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_counts_recoveries() {
        let stats = LoadStats {
            total: 4,
            inserted: 1,
            recovered_live: 1,
            recovered_snapshot: 1,
            skipped: 1,
            ..LoadStats::default()
        };
        assert_eq!(stats.loaded(), 3);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(LoadStats::new().success_rate(), 0.0);

        let kept = LoadStats {
            total: 2,
            inserted: 1,
            unchanged: 1,
            ..LoadStats::default()
        };
        assert_eq!(kept.loaded(), 1);
        assert!((kept.success_rate() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge() {
        let mut total = LoadStats::new();
        let day = LoadStats {
            total: 2,
            inserted: 2,
            records_written: 2880,
            records_deleted: 1440,
            ..LoadStats::default()
        };
        total.merge(&day);
        total.merge(&day);
        assert_eq!(total.total, 4);
        assert_eq!(total.records_written, 5760);
        assert_eq!(total.records_deleted, 2880);
    }
}
