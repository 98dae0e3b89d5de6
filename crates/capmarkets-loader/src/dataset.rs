//! 데이터셋 종류와 심볼 정규화.
//!
//! 데이터셋마다 컬렉션, 문서 레이아웃 (심볼 필드 / 시간 필드 / 수치 필드),
//! 심볼 정규화 규칙이 다릅니다. 정규화는 추출, 적재, 스냅샷 파일 이름 모두에서
//! 같은 함수를 거칩니다.
//!
//! 포트폴리오 성과는 심볼 없이 날짜마다 문서 하나를 두는 데이터셋이라
//! 추출/복구 체인 대신 별도 작업([`crate::portfolio`])으로 적재합니다.

use crate::error::LoaderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 적재 대상 데이터셋.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Dataset {
    /// 주식/채권/원자재/변동성 지수 분봉 (Yahoo Finance)
    #[value(name = "market")]
    #[serde(rename = "market")]
    MarketTicks,
    /// 암호화폐 분봉 (Binance)
    #[value(name = "crypto")]
    #[serde(rename = "crypto")]
    CryptoCandles,
    /// 거시경제 지표 (FRED)
    #[value(name = "macro")]
    #[serde(rename = "macro")]
    MacroSeries,
    /// 포트폴리오 일간/누적 수익률
    #[value(name = "portfolio")]
    #[serde(rename = "portfolio")]
    PortfolioPerformance,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Self::MarketTicks,
        Self::CryptoCandles,
        Self::MacroSeries,
        Self::PortfolioPerformance,
    ];

    /// 추출 → 복구 체인으로 적재하는 심볼 기반 데이터셋.
    pub const SYMBOL_KEYED: [Dataset; 3] =
        [Self::MarketTicks, Self::CryptoCandles, Self::MacroSeries];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketTicks => "market",
            Self::CryptoCandles => "crypto",
            Self::MacroSeries => "macro",
            Self::PortfolioPerformance => "portfolio",
        }
    }

    /// 심볼별 배치를 받는 데이터셋인지 여부.
    pub fn is_symbol_keyed(&self) -> bool {
        !matches!(self, Self::PortfolioPerformance)
    }

    /// 기본 컬렉션 이름 (환경변수로 재정의 가능).
    pub fn default_collection(&self) -> &'static str {
        match self {
            Self::MarketTicks => "yfinanceMarketData",
            Self::CryptoCandles => "binanceCryptoData",
            Self::MacroSeries => "pyfredapiMacroeconomicIndicators",
            Self::PortfolioPerformance => "portfolio_performance",
        }
    }

    /// 컬렉션 이름을 재정의하는 환경변수.
    pub fn collection_env(&self) -> &'static str {
        match self {
            Self::MarketTicks => "YFINANCE_TIMESERIES_COLLECTION",
            Self::CryptoCandles => "BINANCE_TIMESERIES_COLLECTION",
            Self::MacroSeries => "PYFREDAPI_COLLECTION",
            Self::PortfolioPerformance => "PORTFOLIO_PERFORMANCE_COLLECTION",
        }
    }

    /// 심볼 목록 환경변수. 심볼이 없는 데이터셋은 `None`.
    pub fn symbols_env(&self) -> Option<&'static str> {
        match self {
            Self::MarketTicks => Some("MARKET_SYMBOLS"),
            Self::CryptoCandles => Some("CRYPTO_SYMBOLS"),
            Self::MacroSeries => Some("MACRO_SERIES"),
            Self::PortfolioPerformance => None,
        }
    }

    pub fn symbol_field(&self) -> &'static str {
        match self {
            Self::MacroSeries => "series_id",
            _ => "symbol",
        }
    }

    pub fn time_field(&self) -> &'static str {
        match self {
            Self::MacroSeries | Self::PortfolioPerformance => "date",
            _ => "timestamp",
        }
    }

    /// 수치로 강제 변환되는 필드.
    pub fn value_fields(&self) -> &'static [&'static str] {
        match self {
            Self::MacroSeries => &["value"],
            Self::PortfolioPerformance => &[
                "percentage_of_daily_return",
                "percentage_of_cumulative_return",
            ],
            _ => &["open", "high", "low", "close", "volume"],
        }
    }

    /// 심볼 정규화. 여러 번 적용해도 결과가 같습니다.
    ///
    /// ```
    /// use capmarkets_loader::Dataset;
    ///
    /// assert_eq!(Dataset::MarketTicks.normalize_symbol("^VIX"), "VIX");
    /// assert_eq!(Dataset::CryptoCandles.normalize_symbol("BTCUSDT"), "BTC");
    /// assert_eq!(Dataset::MacroSeries.normalize_symbol(" unrate "), "UNRATE");
    /// ```
    pub fn normalize_symbol(&self, raw: &str) -> String {
        let symbol = raw.trim();
        match self {
            Self::MarketTicks => symbol.trim_start_matches('^').to_string(),
            Self::CryptoCandles => symbol
                .strip_suffix("USDT")
                .filter(|base| !base.is_empty())
                .unwrap_or(symbol)
                .to_string(),
            Self::MacroSeries => symbol.to_uppercase(),
            Self::PortfolioPerformance => symbol.to_string(),
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "market" | "yfinance" => Ok(Self::MarketTicks),
            "crypto" | "binance" => Ok(Self::CryptoCandles),
            "macro" | "pyfredapi" => Ok(Self::MacroSeries),
            "portfolio" | "portfolio_performance" => Ok(Self::PortfolioPerformance),
            other => Err(LoaderError::Config(format!("unknown dataset: {}", other))),
        }
    }
}
