//! Vigil command line
//!
//! `check` samples once, `watch` monitors until interrupted, `cleanup` forces
//! a recovery cycle, and `config` inspects or validates configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MonitorConfig;
use crate::errors::{CycleRejected, VigilError};
use crate::observability::{init_file_logging, init_tracing, init_tracing_with_filter, LogFormat};
use crate::resource::{ConcurrencyLimiter, Domain, Snapshot, Status};
use crate::self_healing::CycleReport;
use crate::supervision::{HealthMonitor, HealthSummary, MonitorEvent, OverallStatus};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Adaptive health monitoring and self-healing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write a daily-rotated log file into DIR
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,
}

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample every domain once and report its status
    Check {
        /// Domains to check (default: all configured)
        #[arg(short, long = "domain", value_name = "DOMAIN")]
        domains: Vec<Domain>,

        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Monitor continuously, printing events until interrupted
    Watch {
        #[arg(short, long = "domain", value_name = "DOMAIN")]
        domains: Vec<Domain>,

        /// Tick interval override in milliseconds (at least 2)
        #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(2..))]
        interval_ms: Option<u64>,

        /// Stop after this many seconds
        #[arg(long, value_name = "SECS")]
        duration_secs: Option<u64>,

        /// Observe only; never run recovery automatically
        #[arg(long)]
        no_auto_cleanup: bool,

        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Force a recovery cycle, bypassing throttle and cooldowns
    Cleanup {
        #[arg(short, long = "domain", value_name = "DOMAIN")]
        domains: Vec<Domain>,

        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default configuration as TOML
    Init,
    /// Validate a configuration file
    Validate {
        /// File to validate (default: the resolved config)
        file: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    if cli.no_color || std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let config_path = cli.config.as_deref().map(expand_home);

    match cli.command {
        Commands::Config(cmd) => run_config(cmd, config_path.as_deref()),
        Commands::Check {
            domains,
            output_format,
        } => {
            let mut config = MonitorConfig::load(config_path.as_deref())?;
            config.enable_auto_cleanup = false;
            let monitor = build_monitor(config)?;
            let domains = resolve_domains(&monitor, domains);

            let reports = futures::future::join_all(domains.iter().map(|d| monitor.tick(*d))).await;
            let snapshots: Vec<Snapshot> = reports.into_iter().map(|r| r.snapshot).collect();
            print_check(&snapshots, &monitor.summary(), output_format)
        }
        Commands::Cleanup {
            domains,
            output_format,
        } => {
            let config = MonitorConfig::load(config_path.as_deref())?;
            let monitor = build_monitor(config)?;
            let domains = resolve_domains(&monitor, domains);
            let results = monitor.force_cleanup(&domains).await;
            print_cleanup(&results, output_format)?;

            if let Some(Err(rejected)) = results.iter().find(|r| r.is_err()) {
                return Err(VigilError::Rejected(rejected.clone()).into());
            }
            Ok(())
        }
        Commands::Watch {
            domains,
            interval_ms,
            duration_secs,
            no_auto_cleanup,
            output_format,
        } => {
            let mut config = MonitorConfig::load(config_path.as_deref())?;
            if let Some(ms) = interval_ms {
                config.monitoring_interval_ms = ms;
                config.sample_timeout_ms = config.sample_timeout_ms.min(ms - 1);
            }
            if no_auto_cleanup {
                config.enable_auto_cleanup = false;
            }
            let monitor = build_monitor(config)?;
            let domains = resolve_domains(&monitor, domains);
            watch(&monitor, &domains, duration_secs.map(Duration::from_secs), output_format).await
        }
    }
}

fn init_logging(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if cli.verbose { "info" } else { "warn" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    if let Some(dir) = &cli.log_dir {
        return init_file_logging(dir, &filter);
    }
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    if cli.verbose || cli.log_json {
        init_tracing_with_filter(&filter, format);
    } else {
        init_tracing();
    }
    None
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest).to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string()),
        None => path.to_string(),
    }
}

fn build_monitor(config: MonitorConfig) -> Result<HealthMonitor> {
    let limiter = Arc::new(ConcurrencyLimiter::new(
        config.limits.max_connections,
        config.limits.min_connections,
    ));
    HealthMonitor::builder(config)
        .system_providers()
        .limiter(limiter)
        .default_strategies()
        .build()
        .map_err(|e| VigilError::Config(e).into())
}

fn resolve_domains(monitor: &HealthMonitor, domains: Vec<Domain>) -> Vec<Domain> {
    if domains.is_empty() {
        monitor.config().domains
    } else {
        domains
    }
}

fn run_config(cmd: ConfigCommand, path: Option<&str>) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let config = MonitorConfig::load(path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigCommand::Init => {
            print!("{}", MonitorConfig::default().to_toml()?);
        }
        ConfigCommand::Validate { file } => {
            let file = file.map(|f| expand_home(&f)).or_else(|| path.map(str::to_string));
            MonitorConfig::load(file.as_deref())
                .with_context(|| format!("Invalid config {}", file.as_deref().unwrap_or("(defaults)")))?;
            println!("{} configuration is valid", "✓".green());
        }
    }
    Ok(())
}

async fn watch(
    monitor: &HealthMonitor,
    domains: &[Domain],
    duration: Option<Duration>,
    format: OutputFormat,
) -> Result<()> {
    let mut events = monitor.subscribe();
    monitor.start_domains(domains)?;

    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, format)?,
                None => break,
            },
            _ = poll.tick() => {
                if crate::is_shutdown_requested() {
                    break;
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    break;
                }
            }
        }
    }

    monitor.shutdown().await;
    if let OutputFormat::Text = format {
        print_summary(&monitor.summary());
    }
    Ok(())
}

fn paint_status(status: Status) -> ColoredString {
    match status {
        Status::Normal => status.as_str().green(),
        Status::Warning => status.as_str().yellow(),
        Status::Critical => status.as_str().red(),
        Status::Exhausted => status.as_str().red().bold(),
    }
}

fn paint_overall(status: OverallStatus) -> ColoredString {
    match status {
        OverallStatus::Healthy => "healthy".green().bold(),
        OverallStatus::Degraded => "degraded".yellow().bold(),
        OverallStatus::Unhealthy => "unhealthy".red().bold(),
    }
}

fn format_snapshot(snapshot: &Snapshot) -> String {
    match &snapshot.error {
        Some(error) => format!(
            "{:<22} {:<10} {}",
            snapshot.domain.to_string(),
            "unknown".dimmed(),
            error.dimmed()
        ),
        None => format!(
            "{:<22} {:<10} {:>6.1}%  ({:.0} / {:.0} {})",
            snapshot.domain.to_string(),
            paint_status(snapshot.status),
            snapshot.usage_ratio * 100.0,
            snapshot.current,
            snapshot.maximum,
            snapshot.unit
        ),
    }
}

fn print_check(snapshots: &[Snapshot], summary: &HealthSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "status": summary.status,
                "snapshots": snapshots,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "Health:".bold(), paint_overall(summary.status));
            for snapshot in snapshots {
                println!("  {}", format_snapshot(snapshot));
            }
        }
    }
    Ok(())
}

fn print_cleanup(results: &[Result<CycleReport, CycleRejected>], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let out: Vec<serde_json::Value> = results
                .iter()
                .map(|r| match r {
                    Ok(report) => serde_json::to_value(report).unwrap_or_default(),
                    Err(rejected) => serde_json::json!({
                        "domain": rejected.domain(),
                        "rejected": rejected.code(),
                        "error": rejected.to_string(),
                    }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            for result in results {
                match result {
                    Ok(report) if !report.attempted() => {
                        println!("{:<22} {}", report.domain.to_string(), "nothing to do".dimmed())
                    }
                    Ok(report) => {
                        println!(
                            "{:<22} released {:.0} in {}ms",
                            report.domain.to_string(),
                            report.total_released,
                            report.duration_ms
                        );
                        for o in &report.outcomes {
                            let mark = if o.success { "✓".green() } else { "✗".red() };
                            println!(
                                "    {} {} ({} attempts){}",
                                mark,
                                o.strategy,
                                o.attempts,
                                o.error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default()
                            );
                        }
                    }
                    Err(rejected) => println!(
                        "{:<22} {} {}",
                        rejected.domain().to_string(),
                        rejected.code().red(),
                        rejected
                    ),
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &MonitorEvent, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let now = chrono::Local::now().format("%H:%M:%S");
    match event {
        MonitorEvent::ResourceUpdated(snapshots) => {
            for snapshot in snapshots {
                println!("{} {}", now.to_string().dimmed(), format_snapshot(snapshot));
            }
        }
        MonitorEvent::StatusChanged { domain, from, to } => println!(
            "{} {} {} -> {}",
            now.to_string().dimmed(),
            domain.to_string().bold(),
            paint_status(*from),
            paint_status(*to)
        ),
        MonitorEvent::RecoverySuccess { domain, strategy } => println!(
            "{} {} {} recovered {}",
            now.to_string().dimmed(),
            "✓".green(),
            strategy,
            domain
        ),
        MonitorEvent::CleanupFailed { domain, error } => println!(
            "{} {} {}: {}",
            now.to_string().dimmed(),
            "✗".red(),
            domain,
            error
        ),
        other => println!("{} {}", now.to_string().dimmed(), other.name().dimmed()),
    }
    Ok(())
}

fn print_summary(summary: &HealthSummary) {
    println!("\n{} {}", "Health:".bold(), paint_overall(summary.status));
    for d in &summary.domains {
        let stats = &d.statistics;
        println!(
            "  {:<22} {:<10} avg {:>5.1}%  peak {:>5.1}%  samples {}  cleanups {}",
            d.domain.to_string(),
            d.status.map(paint_status).unwrap_or_else(|| "-".dimmed()),
            stats.avg_usage * 100.0,
            stats.peak_usage * 100.0,
            stats.sample_count,
            stats.cleanup_count
        );
    }
    println!(
        "  recovery: {} cycles, {:.0}% of {} outcomes succeeded",
        summary.recovery.cycles,
        summary.recovery.success_rate * 100.0,
        summary.recovery.successes + summary.recovery.failures
    );
}
