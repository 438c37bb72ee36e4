//! Volcast CLI
//!
//! Runs the forecasting engine against a SQLite store.
//!
//! Usage:
//!   volcast import-csv --symbol SPY --file spy.csv --h 5 --coverage 0.95
//!   volcast forecast --symbol SPY --as-of 2024-03-08 --estimator garch-t
//!   volcast calibrate --symbol SPY --base GBM-CC --h 5 --as-of 2024-03-08 --mode CQR --apply
//!   volcast tick --symbol SPY --day 2024-03-11
//!   volcast rescan --symbol SPY --from 2023-01-03 --to 2024-03-08
//!   volcast show --symbol SPY forecasts
//!
//! Environment Variables:
//!   VOLCAST_CONFIG_PATH - TOML config (default: volcast.toml)
//!   VOLCAST_DB_PATH - SQLite database (overrides config)
//!   RUST_LOG - log filter (default: volcast=info)

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volcast::calendar::TradingCalendar;
use volcast::config::EngineConfig;
use volcast::models::{CanonicalRow, Estimator, Method, TargetSpec};
use volcast::store::{CanonicalStore, EventStore, ForecastStore, SqliteStore, TargetStore};
use volcast::volatility::{GarchParams, Innovation, RangeParams};
use volcast::{EstimatorChoice, ForecastPipeline, ForecastRequest};

#[derive(Parser, Debug)]
#[command(name = "volcast")]
#[command(about = "Volatility forecasts, conformal intervals and breakout events")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, env = "VOLCAST_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// SQLite database (overrides config)
    #[arg(long, env = "VOLCAST_DB_PATH")]
    db: Option<String>,

    /// Exchange holiday (YYYY-MM-DD); repeat for several
    #[arg(long = "holiday")]
    holidays: Vec<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import daily OHLCV rows from a CSV file with a header line
    ImportCsv {
        #[arg(short, long)]
        symbol: String,

        #[arg(short, long)]
        file: PathBuf,

        /// Also store a target spec with this horizon
        #[arg(long)]
        h: Option<u32>,

        #[arg(long, default_value = "0.95")]
        coverage: f64,

        #[arg(long, default_value = "America/New_York")]
        exchange_tz: String,
    },

    /// Store or replace the target spec for a symbol
    SetTarget {
        #[arg(short, long)]
        symbol: String,

        #[arg(long)]
        h: u32,

        #[arg(long)]
        coverage: f64,

        #[arg(long, default_value = "America/New_York")]
        exchange_tz: String,
    },

    /// Compose and store a base forecast
    Forecast {
        #[arg(short, long)]
        symbol: String,

        #[arg(long)]
        as_of: NaiveDate,

        /// GBM-CC, GARCH11-N, GARCH11-t, HAR-RV, Range-P/GK/RS/YZ
        #[arg(short, long, default_value = "GBM-CC")]
        estimator: String,

        #[arg(long)]
        h: Option<u32>,

        #[arg(long)]
        coverage: Option<f64>,

        /// Print without storing
        #[arg(long)]
        dry_run: bool,
    },

    /// Calibrate a conformal mode on stored base forecasts
    Calibrate {
        #[arg(short, long)]
        symbol: String,

        /// Base method tag
        #[arg(short, long, default_value = "GBM-CC")]
        base: String,

        #[arg(long)]
        h: u32,

        #[arg(long, default_value = "0.95")]
        coverage: f64,

        #[arg(long)]
        as_of: NaiveDate,

        /// Overrides conformal.mode from the config
        #[arg(long)]
        mode: Option<String>,

        /// Apply to the same-day base forecast and store the result
        #[arg(long)]
        apply: bool,
    },

    /// Run one event tick
    Tick {
        #[arg(short, long)]
        symbol: String,

        #[arg(long)]
        day: NaiveDate,

        /// Forecast method used for breakout detection (default: active record)
        #[arg(long)]
        method: Option<String>,
    },

    /// Walk the event machine over a date range
    Rescan {
        #[arg(short, long)]
        symbol: String,

        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        #[arg(long)]
        method: Option<String>,
    },

    /// Print stored records as JSON
    Show {
        #[arg(short, long)]
        symbol: String,

        #[arg(value_enum)]
        what: ShowWhat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShowWhat {
    Rows,
    Target,
    Forecasts,
    Events,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volcast=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_method(raw: &str) -> Result<Method> {
    raw.parse().map_err(|e: String| anyhow::anyhow!(e))
}

/// Maps an estimator tag onto configured parameters.
fn estimator_choice(config: &EngineConfig, estimator: Estimator) -> Result<EstimatorChoice> {
    Ok(match estimator {
        Estimator::Gbm => EstimatorChoice::Gbm,
        Estimator::GarchNormal => EstimatorChoice::Garch(GarchParams {
            innovation: Innovation::Normal,
            ..config.garch_params()?
        }),
        Estimator::GarchStudentT => EstimatorChoice::Garch(GarchParams {
            innovation: Innovation::StudentT {
                df: config.garch.df,
            },
            ..config.garch_params()?
        }),
        Estimator::HarRv => EstimatorChoice::Har(config.har_params()),
        Estimator::Range(est) => EstimatorChoice::Range(RangeParams {
            estimator: est,
            ..config.range_params()?
        }),
    })
}

/// Parses `date,open,high,low,close[,adj_close][,volume]` with a header row.
/// Column order follows the header; `adj_close` falls back to `close`.
fn parse_csv(text: &str) -> Result<Vec<CanonicalRow>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines
        .next()
        .context("empty CSV")?
        .split(',')
        .map(|h| h.trim().to_ascii_lowercase().replace(' ', "_"))
        .collect();
    let col = |name: &str| header.iter().position(|h| h == name);
    let date_col = col("date").context("CSV needs a date column")?;
    let (open, high, low, close) = (col("open"), col("high"), col("low"), col("close"));
    let adj = col("adj_close").or(close);
    let volume = col("volume");

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let num = |c: Option<usize>| -> Option<f64> {
            c.and_then(|c| fields.get(c))
                .and_then(|f| f.parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };
        let date: NaiveDate = fields
            .get(date_col)
            .with_context(|| format!("line {}: missing date", i + 2))?
            .parse()
            .with_context(|| format!("line {}: bad date", i + 2))?;
        let adj_close = num(adj);
        rows.push(CanonicalRow {
            date,
            open: num(open),
            high: num(high),
            low: num(low),
            close: num(close),
            adj_close,
            volume: num(volume),
            r: None,
            valid: adj_close.is_some_and(|p| p > 0.0),
        });
    }
    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) if path.exists() => EngineConfig::load(path)?,
        _ => EngineConfig::from_env()?,
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    let store = Arc::new(SqliteStore::new(&config.db_path)?);
    let calendar = TradingCalendar::weekdays().with_holidays(cli.holidays.iter().copied());
    let pipeline = ForecastPipeline::new(store.clone(), calendar);

    match cli.command {
        Commands::ImportCsv {
            symbol,
            file,
            h,
            coverage,
            exchange_tz,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let rows = parse_csv(&text)?;
            let invalid = rows.iter().filter(|r| !r.valid).count();
            let n = store.put_rows(&symbol, rows).await?;
            info!(symbol = %symbol, rows = n, invalid, "canonical rows imported");
            if let Some(h) = h {
                store
                    .put_target(TargetSpec {
                        symbol: symbol.clone(),
                        h,
                        coverage,
                        exchange_tz,
                    })
                    .await?;
            }
            println!("imported {} rows for {} ({} invalid)", n, symbol, invalid);
        }

        Commands::SetTarget {
            symbol,
            h,
            coverage,
            exchange_tz,
        } => {
            let spec = TargetSpec {
                symbol,
                h,
                coverage,
                exchange_tz,
            };
            store.put_target(spec.clone()).await?;
            print_json(&spec)?;
        }

        Commands::Forecast {
            symbol,
            as_of,
            estimator,
            h,
            coverage,
            dry_run,
        } => {
            let estimator: Estimator = estimator.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let request = ForecastRequest {
                estimator: estimator_choice(&config, estimator)?,
                h,
                coverage,
                window_n: config.gbm.window_n,
                lambda_drift: config.gbm.lambda_drift,
            };
            let record = pipeline.forecast(&symbol, as_of, &request).await?;
            if !dry_run {
                pipeline.persist(&record).await?;
            }
            print_json(&record)?;
        }

        Commands::Calibrate {
            symbol,
            base,
            h,
            coverage,
            as_of,
            mode,
            apply,
        } => {
            let base: Estimator = base.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let mut cal = config.calibration(coverage)?;
            if let Some(mode) = mode {
                cal.mode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            }
            let state = pipeline
                .calibrate_conformal(&symbol, base, h, &cal, as_of)
                .await?;
            print_json(&state)?;
            if apply {
                let record = pipeline.apply_conformal(&symbol, &state, as_of).await?;
                print_json(&record)?;
            }
        }

        Commands::Tick {
            symbol,
            day,
            method,
        } => {
            let method = method.as_deref().map(parse_method).transpose()?;
            let events = config.event_config()?;
            let tick = pipeline.tick_events(&symbol, day, &events, method).await?;
            print_json(&tick)?;
        }

        Commands::Rescan {
            symbol,
            from,
            to,
            method,
        } => {
            let method = method.as_deref().map(parse_method).transpose()?;
            let events = config.event_config()?;
            let report = pipeline
                .rescan_events(&symbol, from, to, &events, method)
                .await?;
            println!(
                "processed {} days ({} paused), {} events",
                report.days_processed,
                report.days_paused,
                report.events.len()
            );
            print_json(&report.events)?;
        }

        Commands::Show { symbol, what } => match what {
            ShowWhat::Rows => print_json(&store.rows(&symbol).await?)?,
            ShowWhat::Target => print_json(&store.target(&symbol).await?)?,
            ShowWhat::Forecasts => print_json(&store.forecasts(&symbol).await?)?,
            ShowWhat::Events => print_json(&store.events(&symbol).await?)?,
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_header_order_and_fallback() {
        let text = "Date,Close,High,Low,Open,Volume\n\
                    2024-03-05,101,102,99,100,1000\n\
                    2024-03-04,100,101,98,99,900\n\
                    2024-03-06,,,,,\n";
        let rows = parse_csv(text).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, "2024-03-04".parse::<NaiveDate>().unwrap());
        assert_eq!(rows[1].adj_close, Some(101.0));
        assert_eq!(rows[1].open, Some(100.0));
        assert!(!rows[2].valid);
    }

    #[test]
    fn test_estimator_choice_respects_tag() {
        let config = EngineConfig::default();
        let choice = estimator_choice(&config, "GARCH11-t".parse().unwrap()).unwrap();
        assert_eq!(choice.estimator(), Estimator::GarchStudentT);
        let choice = estimator_choice(&config, "Range-RS".parse().unwrap()).unwrap();
        assert_eq!(choice.estimator().to_string(), "Range-RS");
    }
}
