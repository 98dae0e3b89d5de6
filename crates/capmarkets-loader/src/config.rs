//! 환경변수 기반 설정 모듈.

use crate::dataset::Dataset;
use crate::error::{LoaderError, Result};
use capmarkets_store::config::env_var_parse;
use capmarkets_store::StoreConfig;
use chrono::{NaiveTime, Weekday};
use std::path::PathBuf;
use std::time::Duration;

/// Loader 전체 설정
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// 스토어 연결 설정
    pub store: StoreConfig,
    /// 스냅샷 파일 디렉터리
    pub snapshot_dir: PathBuf,
    /// 추출 파일 디렉터리
    pub inbox_dir: PathBuf,
    /// 보존 기간 (일)
    pub retention_days: i64,
    /// 시장 데이터 설정
    pub market: DatasetConfig,
    /// 암호화폐 데이터 설정
    pub crypto: DatasetConfig,
    /// 거시경제 지표 설정
    pub macro_series: DatasetConfig,
    /// 포트폴리오 성과 설정
    pub portfolio: DatasetConfig,
    /// 스케줄러 설정
    pub schedule: ScheduleConfig,
}

/// 데이터셋별 설정
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub dataset: Dataset,
    /// 컬렉션 이름
    pub collection: String,
    /// 적재 대상 심볼 (정규화 전 원본)
    pub symbols: Vec<String>,
    /// 일일 실행 시각 (UTC)
    pub run_at: NaiveTime,
    /// 실행 요일
    pub weekdays: Vec<Weekday>,
}

/// 스케줄러 설정
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// 심볼 기반 데이터셋의 실행 요일
    pub weekdays: Vec<Weekday>,
    /// 폴링 주기 (초)
    pub poll_interval_secs: u64,
}

impl LoaderConfig {
    /// 환경변수에서 설정 로드
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let store = StoreConfig::from_env();
        store
            .require_target()
            .map_err(|e| LoaderError::Config(e.to_string()))?;

        let weekdays = parse_weekdays(
            &std::env::var("SCHEDULE_WEEKDAYS").unwrap_or_else(|_| "tue,wed,thu,fri,sat".to_string()),
        )?;
        let portfolio_weekdays = match std::env::var("SCHEDULE_PORTFOLIO_WEEKDAYS") {
            Ok(raw) => parse_weekdays(&raw)?,
            Err(_) => EVERY_DAY.to_vec(),
        };

        Ok(Self {
            store,
            snapshot_dir: std::env::var("SNAPSHOT_DIR")
                .unwrap_or_else(|_| "./backup".to_string())
                .into(),
            inbox_dir: std::env::var("INBOX_DIR")
                .unwrap_or_else(|_| "./inbox".to_string())
                .into(),
            retention_days: env_var_parse("RETENTION_DAYS", 60),
            market: DatasetConfig::from_env(Dataset::MarketTicks, "SCHEDULE_MARKET_AT", "04:00")?
                .with_weekdays(weekdays.clone()),
            crypto: DatasetConfig::from_env(Dataset::CryptoCandles, "SCHEDULE_CRYPTO_AT", "04:05")?
                .with_weekdays(weekdays.clone()),
            macro_series: DatasetConfig::from_env(
                Dataset::MacroSeries,
                "SCHEDULE_MACRO_AT",
                "04:10",
            )?
            .with_weekdays(weekdays.clone()),
            portfolio: DatasetConfig::from_env(
                Dataset::PortfolioPerformance,
                "SCHEDULE_PORTFOLIO_AT",
                "04:10",
            )?
            .with_weekdays(portfolio_weekdays),
            schedule: ScheduleConfig {
                weekdays,
                poll_interval_secs: env_var_parse("SCHEDULER_POLL_SECS", 1),
            },
        })
    }

    /// 인메모리 스토어를 쓰는 설정 (테스트/드라이런용)
    pub fn in_memory(name: &str, snapshot_dir: PathBuf, inbox_dir: PathBuf) -> Self {
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            store: StoreConfig::in_memory(name),
            snapshot_dir,
            inbox_dir,
            retention_days: 60,
            market: DatasetConfig::new(Dataset::MarketTicks, Vec::new(), at(4, 0)),
            crypto: DatasetConfig::new(Dataset::CryptoCandles, Vec::new(), at(4, 5)),
            macro_series: DatasetConfig::new(Dataset::MacroSeries, Vec::new(), at(4, 10)),
            portfolio: DatasetConfig::new(Dataset::PortfolioPerformance, Vec::new(), at(4, 10)),
            schedule: ScheduleConfig::default(),
        }
    }

    pub fn dataset(&self, dataset: Dataset) -> &DatasetConfig {
        match dataset {
            Dataset::MarketTicks => &self.market,
            Dataset::CryptoCandles => &self.crypto,
            Dataset::MacroSeries => &self.macro_series,
            Dataset::PortfolioPerformance => &self.portfolio,
        }
    }

    pub fn dataset_mut(&mut self, dataset: Dataset) -> &mut DatasetConfig {
        match dataset {
            Dataset::MarketTicks => &mut self.market,
            Dataset::CryptoCandles => &mut self.crypto,
            Dataset::MacroSeries => &mut self.macro_series,
            Dataset::PortfolioPerformance => &mut self.portfolio,
        }
    }
}

impl DatasetConfig {
    /// 실행 요일은 심볼 기반 데이터셋이면 화~토, 포트폴리오는 매일입니다.
    pub fn new(dataset: Dataset, symbols: Vec<String>, run_at: NaiveTime) -> Self {
        let weekdays = if dataset.is_symbol_keyed() {
            ScheduleConfig::default().weekdays
        } else {
            EVERY_DAY.to_vec()
        };
        Self {
            dataset,
            collection: dataset.default_collection().to_string(),
            symbols,
            run_at,
            weekdays,
        }
    }

    pub fn with_weekdays(mut self, weekdays: Vec<Weekday>) -> Self {
        self.weekdays = weekdays;
        self
    }

    fn from_env(dataset: Dataset, schedule_key: &str, default_at: &str) -> Result<Self> {
        let run_at = parse_time_of_day(
            &std::env::var(schedule_key).unwrap_or_else(|_| default_at.to_string()),
        )?;
        let symbols = dataset
            .symbols_env()
            .and_then(|key| std::env::var(key).ok())
            .map(|raw| parse_symbols(&raw))
            .unwrap_or_default();
        let mut config = Self::new(dataset, symbols, run_at);
        if let Ok(collection) = std::env::var(dataset.collection_env()) {
            config.collection = collection;
        }
        Ok(config)
    }
}

const EVERY_DAY: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            weekdays: vec![
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
            poll_interval_secs: 1,
        }
    }
}

impl ScheduleConfig {
    /// 폴링 주기를 Duration으로 반환
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// 공백/쉼표로 구분된 심볼 목록 파싱
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `HH:MM` 형식 시각 파싱
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| LoaderError::Config(format!("invalid time of day '{}': {}", raw, e)))
}

/// `tue,wed,...` 형식 요일 목록 파싱
pub fn parse_weekdays(raw: &str) -> Result<Vec<Weekday>> {
    parse_symbols(raw)
        .iter()
        .map(|day| {
            day.parse::<Weekday>()
                .map_err(|_| LoaderError::Config(format!("invalid weekday '{}'", day)))
        })
        .collect()
}
