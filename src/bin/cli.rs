use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use supplycheck::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "supplycheck", version)]
#[command(about = "Check a pharmacy's drug list against the MHLW supply-status spreadsheet", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config path)
    #[arg(short, long, global = true, env = "SUPPLYCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match a pharmacy spreadsheet against the cached MHLW table
    Check(CheckArgs),
    /// Download the MHLW workbook if it changed
    Refresh(RefreshArgs),
    /// Show the state of the local cache
    Status,
    /// Page through the cached MHLW table
    Preview(PreviewArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct CheckArgs {
    /// Pharmacy spreadsheet (xlsx, xls, ods or csv)
    file: PathBuf,
    /// Recency window in days
    #[arg(short, long)]
    days_back: Option<i64>,
    /// Output format
    #[arg(long, value_enum, default_value_t = ExportFormatOpt::Json)]
    format: ExportFormatOpt,
    /// Write results to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct RefreshArgs {
    /// Download even if the cached copy looks current
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct PreviewArgs {
    /// Only show rows containing this text
    #[arg(short, long)]
    search: Option<String>,
    /// Page number, starting at 1
    #[arg(long, default_value_t = 1)]
    page: usize,
    /// Rows per page
    #[arg(long)]
    per_page: Option<usize>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ExportFormatOpt {
    Json,
    Jsonl,
    Csv,
}

impl From<ExportFormatOpt> for ExportFormat {
    fn from(opt: ExportFormatOpt) -> Self {
        match opt {
            ExportFormatOpt::Json => ExportFormat::Json,
            ExportFormatOpt::Jsonl => ExportFormat::JsonLines,
            ExportFormatOpt::Csv => ExportFormat::Csv,
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("supplycheck={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CheckerConfig> {
    match path {
        Some(path) => Ok(CheckerConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?
            .with_env_overrides()),
        None => Ok(CheckerConfig::load()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    match cli.command {
        Commands::Check(args) => runtime.block_on(cmd_check(config, args)),
        Commands::Refresh(args) => runtime.block_on(cmd_refresh(config, args)),
        Commands::Status => cmd_status(config),
        Commands::Preview(args) => cmd_preview(config, args),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn cmd_check(config: CheckerConfig, args: CheckArgs) -> anyhow::Result<()> {
    if !args.file.exists() {
        bail!(SupplyCheckError::file_not_found_with_suggestion(args.file.clone()).user_message());
    }
    let bytes = std::fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let days_back = args.days_back.unwrap_or(config.days_back);

    let service = SupplyService::new(config);
    let result = service.check_upload_with(bytes, &file_name, days_back).await;
    eprintln!(
        "{} ({} rows, {} matched, {} recent)",
        result.message, result.stats.pharmacy_rows, result.stats.matched_rows, result.stats.recent_updates
    );

    let exporter = MatchExporter::new(args.format.into());
    match args.output {
        Some(path) => {
            exporter
                .export(&result, &path)
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            eprintln!("Wrote {} results to {}", exporter.format(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            exporter
                .write(&result, &mut lock)
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            lock.flush()?;
        }
    }

    if !result.success {
        bail!("{}", result.message);
    }
    Ok(())
}

async fn cmd_refresh(config: CheckerConfig, args: RefreshArgs) -> anyhow::Result<()> {
    let service = SupplyService::new(config);
    let outcome = service.refresh_now(args.force).await;
    println!("{}", outcome.message);
    if !outcome.success {
        bail!("refresh failed");
    }
    Ok(())
}

fn cmd_status(config: CheckerConfig) -> anyhow::Result<()> {
    let path = config.excel_path();
    let status = SupplyDownloader::new(config).status();
    println!("Cache file:    {}", path.display());
    println!("Present:       {}", if status.file_exists { "yes" } else { "no" });
    if status.file_exists {
        println!("Size:          {} bytes", status.file_size);
    }
    println!("Data date:     {}", status.file_date);
    println!("Source URL:    {}", if status.url.is_empty() { "-" } else { status.url.as_str() });
    println!("Downloaded at: {}", status.downloaded_at.as_deref().unwrap_or("-"));
    println!("Last-Modified: {}", status.last_modified.as_deref().unwrap_or("-"));
    println!("Checked at:    {}", status.checked_at.as_deref().unwrap_or("-"));
    Ok(())
}

fn cmd_preview(config: CheckerConfig, args: PreviewArgs) -> anyhow::Result<()> {
    let per_page = args.per_page.unwrap_or(config.items_per_page);
    let reference = ReferenceTable::load(config.excel_path(), &config.patterns)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let page = reference.preview(args.search.as_deref(), args.page, per_page);
    println!("{}", serde_json::to_string_pretty(&page)?);
    eprintln!(
        "Page {}/{} ({} rows)",
        page.page, page.total_pages, page.total_rows
    );
    Ok(())
}
