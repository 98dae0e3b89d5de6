//! Capital-markets loader CLI.

use anyhow::Context;
use capmarkets_loader::{
    Dataset, LoaderConfig, LoaderService, ScheduledJob, Scheduler,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "capmarkets-loader")]
#[command(about = "Capital-markets time-series loader", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON 형식 로그 출력
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 하루치 적재 (YYYYMMDD)
    Load {
        #[arg(long, value_enum)]
        dataset: Dataset,
        /// 대상 날짜 (예: 20250624)
        #[arg(long)]
        date: String,
        /// 특정 심볼만 적재
        #[arg(long)]
        symbol: Option<String>,
    },

    /// 기간 백필 (양 끝 포함)
    Backfill {
        #[arg(long, value_enum)]
        dataset: Dataset,
        /// 시작 날짜 (YYYYMMDD)
        #[arg(long)]
        start: String,
        /// 종료 날짜 (YYYYMMDD)
        #[arg(long)]
        end: String,
        /// 특정 심볼만 적재
        #[arg(long)]
        symbol: Option<String>,
    },

    /// 어제 날짜 적재 (스케줄 실행과 같은 대상)
    Yesterday {
        #[arg(long, value_enum)]
        dataset: Dataset,
    },

    /// 하루치 데이터를 스냅샷 파일로 백업
    Backup {
        #[arg(long, value_enum)]
        dataset: Dataset,
        #[arg(long)]
        date: String,
    },

    /// 오래된 데이터 삭제
    Purge {
        #[arg(long, value_enum)]
        dataset: Dataset,
        /// 보존 기간 (일, 기본값: RETENTION_DAYS)
        #[arg(long)]
        days: Option<i64>,
    },

    /// 데몬 모드: 설정된 시각마다 전날 데이터 적재
    Daemon,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "capmarkets_loader={level},capmarkets_store={level}",
            level = log_level
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!("Capmarkets Loader 시작");

    let config = LoaderConfig::from_env().context("설정 로드 실패")?;
    tracing::debug!(
        snapshot_dir = %config.snapshot_dir.display(),
        inbox_dir = %config.inbox_dir.display(),
        "설정 로드 완료"
    );

    let service = LoaderService::from_config(config)?;
    let result = run(&service, cli.command).await;

    service.factory().close().await;
    tracing::info!("Capmarkets Loader 종료");

    result
}

async fn run(service: &LoaderService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Load {
            dataset,
            date,
            symbol,
        } => {
            match symbol {
                Some(symbol) => {
                    service
                        .load_for_date_by_symbol(dataset, &date, &symbol)
                        .await?
                }
                None => service.load_for_date(dataset, &date).await?,
            };
        }
        Commands::Backfill {
            dataset,
            start,
            end,
            symbol,
        } => {
            let report = match symbol {
                Some(symbol) => {
                    service
                        .backfill_by_symbol(dataset, &start, &end, &symbol)
                        .await?
                }
                None => service.backfill(dataset, &start, &end).await?,
            };
            if !report.failed_dates.is_empty() {
                anyhow::bail!(
                    "backfill failed for {} date(s): {:?}",
                    report.failed_dates.len(),
                    report.failed_dates
                );
            }
        }
        Commands::Yesterday { dataset } => {
            service.load_yesterday(dataset).await?;
        }
        Commands::Backup { dataset, date } => {
            let documents = service.backup(dataset, &date).await?;
            tracing::info!(dataset = %dataset, documents, "백업 완료");
        }
        Commands::Purge { dataset, days } => {
            let days = days.unwrap_or(service.config().retention_days);
            let deleted = service.purge(dataset, days).await?;
            tracing::info!(dataset = %dataset, days, deleted, "정리 완료");
        }
        Commands::Daemon => {
            let config = service.config();
            let mut scheduler = Scheduler::new();
            for dataset in Dataset::ALL {
                let ds = config.dataset(dataset);
                if dataset.is_symbol_keyed() && ds.symbols.is_empty() {
                    tracing::warn!(dataset = %dataset, "심볼 미설정, 스케줄 제외");
                    continue;
                }
                scheduler.add(ScheduledJob::new(
                    service.job(dataset)?,
                    ds.run_at,
                    ds.weekdays.clone(),
                ));
            }
            scheduler
                .run_until_shutdown(config.schedule.poll_interval())
                .await;
        }
    }
    Ok(())
}
