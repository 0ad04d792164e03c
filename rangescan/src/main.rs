//! Rangescan CLI Application
//!
//! A command-line interface for verifying identifier ranges against a
//! rate-limited batch users API through rotating public proxies.
//! This CLI application provides a user-friendly interface to the rangescan-lib library.

mod ui;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::Parser;
use console::Term;
use rangescan_lib::protocols::sources::{DEFAULT_HTML_PAGES, DEFAULT_RAW_LISTS};
use rangescan_lib::{
    load_env_config, parse_duration_string, validate_default_range, validate_workers,
    ConfigManager, EnvConfig, FileConfig,
};
use rangescan_lib::{
    ClientConfig, MinimalUserRecord, PoolConfig, ProxiedClientFactory, ProxyPool, ProxySupplier,
    RangeScanner, RefillConfig, RetryPolicy, ScanConfig, ScanProgress, ScanRequest,
    ScrapeSupplier, StaticSupplier, DEFAULT_UNIT_SIZE, DEFAULT_USERS_ENDPOINT, MAX_BATCH_SIZE,
};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use ui::Spinner;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

/// Default worker count when no source sets one.
const DEFAULT_WORKERS: usize = 8;

/// Exit code for a run that finished with unverified batches.
const EXIT_INCOMPLETE: i32 = 2;

/// CLI arguments for rangescan
#[derive(Parser, Debug)]
#[command(name = "rangescan")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Sai Dutt G.V <gvs46@protonmail.com>")]
#[command(about = "Scan an identifier range against a rate-limited users API through rotating proxies")]
#[command(
    long_about = "Scan the half-open identifier range [LOW, HIGH) against a rate-limited batch users API.\n\nRequests are spread over worker tasks and a self-refilling pool of public proxies.\nInterrupting with Ctrl-C still prints everything verified so far."
)]
#[command(styles = STYLES)]
#[command(allow_negative_numbers = true)]
pub struct Args {
    /// First identifier to scan (inclusive)
    #[arg(value_name = "LOW", help_heading = "Range")]
    pub low: i64,

    /// End of the range (exclusive)
    #[arg(value_name = "HIGH", help_heading = "Range")]
    pub high: i64,

    /// Exclude banned users from the upstream response
    #[arg(long = "exclude-banned", help_heading = "Range")]
    pub exclude_banned: bool,

    /// Worker tasks (default: 8, max: 256)
    #[arg(short = 'w', long = "workers", value_name = "N", help_heading = "Performance")]
    pub workers: Option<usize>,

    /// Fail instead of using fewer workers when the range is too small
    #[arg(long = "no-auto-adjust", help_heading = "Performance")]
    pub no_auto_adjust: bool,

    /// Attempts per batch before it is reported as failed (0 = unbounded)
    #[arg(long = "max-attempts", value_name = "N", help_heading = "Performance")]
    pub max_attempts: Option<u32>,

    /// Per-request timeout (e.g. "6s", "1500ms")
    #[arg(long = "timeout", value_name = "DURATION", help_heading = "Performance")]
    pub timeout: Option<String>,

    /// Read proxies from a file (one host:port per line) instead of scraping
    #[arg(long = "proxy-file", value_name = "FILE", help_heading = "Proxies")]
    pub proxy_file: Option<String>,

    /// Probe every proxy before use and drop the dead ones
    #[arg(long = "verify-proxies", help_heading = "Proxies")]
    pub verify_proxies: bool,

    /// Accept invalid TLS certificates through proxies
    #[arg(long = "insecure-proxies", help_heading = "Proxies")]
    pub insecure_proxies: bool,

    /// Output results in JSON format
    #[arg(short = 'j', long = "json", help_heading = "Output Format")]
    pub json: bool,

    /// Output results in CSV format
    #[arg(long = "csv", help_heading = "Output Format")]
    pub csv: bool,

    /// Write results to a file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE", help_heading = "Output Format")]
    pub output: Option<String>,

    /// Use a specific config file instead of automatic discovery
    #[arg(long = "config", value_name = "FILE", help_heading = "Configuration")]
    pub config: Option<String>,

    /// Show progress logs on stderr
    #[arg(short = 'v', long = "verbose", help_heading = "Debugging")]
    pub verbose: bool,

    /// Show per-attempt debug logs on stderr
    #[arg(short = 'd', long = "debug", help_heading = "Debugging")]
    pub debug: bool,
}

/// Effective run settings after merging config files, environment and CLI.
#[derive(Debug, Clone, PartialEq)]
struct RunSettings {
    workers: usize,
    auto_adjust: bool,
    exclude_banned: bool,
    unit_size: usize,
    batch_size: usize,
    users_endpoint: String,
    launch_jitter: Duration,
    proxy_file: Option<String>,
    verify_proxies: bool,
    insecure: bool,
    request_timeout: Duration,
    probe_timeout: Duration,
    refill_attempts: u32,
    raw_lists: Vec<String>,
    html_pages: Vec<String>,
    max_attempts: Option<u32>,
    max_elapsed: Option<Duration>,
    rate_limit_delay: Duration,
    rotate_after: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        let scan = ScanConfig::default();
        let client = ClientConfig::default();
        let pool = PoolConfig::default();
        let refill = RefillConfig::default();
        let retry = RetryPolicy::default();

        Self {
            workers: DEFAULT_WORKERS,
            auto_adjust: true,
            exclude_banned: scan.exclude_banned,
            unit_size: DEFAULT_UNIT_SIZE,
            batch_size: MAX_BATCH_SIZE,
            users_endpoint: DEFAULT_USERS_ENDPOINT.to_string(),
            launch_jitter: scan.launch_jitter,
            proxy_file: None,
            verify_proxies: refill.verify,
            insecure: client.accept_invalid_certs,
            request_timeout: client.request_timeout,
            probe_timeout: pool.probe_timeout,
            refill_attempts: refill.max_attempts,
            raw_lists: DEFAULT_RAW_LISTS.iter().map(|s| s.to_string()).collect(),
            html_pages: DEFAULT_HTML_PAGES.iter().map(|s| s.to_string()).collect(),
            max_attempts: retry.max_attempts,
            max_elapsed: retry.max_elapsed,
            rate_limit_delay: retry.rate_limit_base_delay,
            rotate_after: retry.rotate_after,
        }
    }
}

impl RunSettings {
    fn scan_config(&self) -> ScanConfig {
        let retry = RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_max_elapsed(self.max_elapsed)
            .with_rate_limit_base_delay(self.rate_limit_delay)
            .with_rotate_after(self.rotate_after);

        ScanConfig::default()
            .with_users_endpoint(self.users_endpoint.clone())
            .with_unit_size(self.unit_size)
            .with_batch_size(self.batch_size)
            .with_exclude_banned(self.exclude_banned)
            .with_launch_jitter(self.launch_jitter)
            .with_retry(retry)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_request_timeout(self.request_timeout)
            .with_accept_invalid_certs(self.insecure)
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig::default().with_probe_timeout(self.probe_timeout)
    }

    fn refill_config(&self) -> RefillConfig {
        RefillConfig::default()
            .with_max_attempts(self.refill_attempts)
            .with_verify(self.verify_proxies)
    }
}

/// `0` on the command line or in config means "no attempt limit".
fn attempts_limit(attempts: u32) -> Option<u32> {
    (attempts > 0).then_some(attempts)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    init_logging(&args);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rangescan starting");

    match run_scan(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(EXIT_INCOMPLETE),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Set up stderr logging. `RUST_LOG` wins over `-v`/`-d`.
fn init_logging(args: &Args) {
    let default_level = if args.debug {
        "rangescan=debug,rangescan_lib=debug"
    } else if args.verbose {
        "rangescan=info,rangescan_lib=info"
    } else {
        "warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(args.debug)
        .try_init();
}

/// Validate command line arguments
fn validate_args(args: &Args) -> Result<(), String> {
    validate_default_range(args.low, args.high).map_err(|e| e.to_string())?;

    if let Some(workers) = args.workers {
        validate_workers(workers).map_err(|e| e.to_string())?;
    }

    // Can't have multiple output formats
    if args.json && args.csv {
        return Err("Cannot specify multiple output formats (--json, --csv)".to_string());
    }

    if let Some(timeout) = &args.timeout {
        if parse_duration_string(timeout).is_none() {
            return Err(format!(
                "Invalid timeout '{}'. Use a format like '6s' or '1500ms'",
                timeout
            ));
        }
    }

    if args.output.as_deref().is_some_and(|o| o.trim().is_empty()) {
        return Err("Output file name cannot be empty".to_string());
    }

    Ok(())
}

/// Main scanning logic. Returns whether every batch was verified.
async fn run_scan(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let settings = build_settings(&args)?;
    let show_spinner = !args.verbose && !args.debug && Term::stderr().is_term();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping workers");
                cancel.cancel();
            }
        });
    }

    let supplier = build_supplier(&settings)?;

    let spinner = Spinner::start(
        format!("Fetching proxies from {}...", supplier.name()),
        show_spinner,
    );
    let endpoints = tokio::select! {
        _ = cancel.cancelled() => Vec::new(),
        endpoints = supplier.scrape() => endpoints,
    };
    spinner.stop().await;

    if endpoints.is_empty() && !cancel.is_cancelled() {
        tracing::warn!(
            supplier = supplier.name(),
            "initial proxy fetch found nothing, workers will refill"
        );
    }

    let pool = ProxyPool::from_endpoints(endpoints, settings.pool_config());
    if settings.verify_proxies && !pool.is_empty() {
        let spinner = Spinner::start(format!("Verifying {} proxies...", pool.len()), show_spinner);
        let summary = pool.verify_all(&cancel).await;
        spinner.stop().await;
        match summary {
            Ok(summary) => tracing::info!(
                probed = summary.probed,
                kept = summary.kept,
                removed = summary.removed,
                "proxy verification finished"
            ),
            // The scan below sees the same token and reports every batch as cancelled.
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let proxies = pool.len();
    let factory = Arc::new(ProxiedClientFactory::new(
        pool,
        supplier,
        settings.client_config(),
        settings.refill_config(),
    ));
    let scanner = RangeScanner::new(factory, settings.scan_config());

    if show_spinner {
        ui::print_header(args.low, args.high, settings.workers, proxies);
    }

    let request = ScanRequest::new(args.low, args.high, settings.workers)
        .with_auto_adjust(settings.auto_adjust);
    let progress = Arc::new(ScanProgress::new());
    let spinner = Spinner::track(progress.clone(), show_spinner);
    let report = scanner.run(request, cancel, progress).await;
    spinner.stop().await;
    let report = report?;

    let records = report.sorted_by_id();
    let rendered = render_results(&records, &args)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered)
                .map_err(|e| format!("Failed to write results to '{}': {}", path, e))?;
            tracing::info!(path = %path, records = records.len(), "results written");
        }
        None => print!("{}", rendered),
    }

    ui::print_summary(&report);
    ui::print_failures(&report, 5);

    Ok(report.is_complete())
}

/// Choose the proxy supplier: a static file when one is configured,
/// the public list scraper otherwise.
fn build_supplier(
    settings: &RunSettings,
) -> Result<Arc<dyn ProxySupplier>, Box<dyn std::error::Error>> {
    match &settings.proxy_file {
        Some(path) => {
            let supplier = StaticSupplier::from_file(path)?;
            if supplier.endpoints().is_empty() {
                return Err(format!(
                    "Proxy file '{}' contains no usable host:port entries",
                    path
                )
                .into());
            }
            tracing::info!(
                path = %path,
                proxies = supplier.endpoints().len(),
                "using static proxy list"
            );
            Ok(Arc::new(supplier))
        }
        None => Ok(Arc::new(ScrapeSupplier::with_sources(
            settings.raw_lists.clone(),
            settings.html_pages.clone(),
        )?)),
    }
}

/// Build run settings from config files, environment and CLI (in that order).
fn build_settings(args: &Args) -> Result<RunSettings, Box<dyn std::error::Error>> {
    let mut settings = RunSettings::default();
    let env_config = load_env_config(args.verbose);

    // Create config manager for file discovery
    let config_manager = ConfigManager::new(args.verbose);

    // Step 1: Determine config file path and load config files
    if let Some(explicit_config_path) = &args.config {
        tracing::info!(path = %explicit_config_path, "using explicit config file (--config)");
        let file_config = config_manager
            .load_file(explicit_config_path)
            .map_err(|e| format!("Failed to load config file '{}': {}", explicit_config_path, e))?;
        settings = merge_file_config(settings, file_config);
    } else if let Some(env_config_path) = &env_config.config {
        tracing::info!(path = %env_config_path, "using explicit config file (RS_CONFIG)");
        let file_config = config_manager
            .load_file(env_config_path)
            .map_err(|e| format!("Failed to load config file '{}': {}", env_config_path, e))?;
        settings = merge_file_config(settings, file_config);
    } else {
        match config_manager.discover_and_load() {
            Ok(file_config) => settings = merge_file_config(settings, file_config),
            Err(e) => tracing::warn!(error = %e, "ignoring discovered config files"),
        }
    }

    // Step 2: Apply environment variables (RS_*)
    settings = apply_environment_config(settings, &env_config);

    // Step 3: Apply CLI arguments (highest precedence)
    Ok(apply_cli_args(settings, args))
}

/// Merge a FileConfig into the run settings.
///
/// Files are validated on load, so unparsable durations cannot reach here.
fn merge_file_config(mut settings: RunSettings, file_config: FileConfig) -> RunSettings {
    let duration = |value: Option<String>| value.as_deref().and_then(parse_duration_string);

    if let Some(scan) = file_config.scan {
        if let Some(workers) = scan.workers {
            settings.workers = workers;
        }
        if let Some(unit_size) = scan.unit_size {
            settings.unit_size = unit_size;
        }
        if let Some(batch_size) = scan.batch_size {
            settings.batch_size = batch_size;
        }
        if let Some(exclude_banned) = scan.exclude_banned {
            settings.exclude_banned = exclude_banned;
        }
        if let Some(auto_adjust) = scan.auto_adjust {
            settings.auto_adjust = auto_adjust;
        }
        if let Some(endpoint) = scan.users_endpoint {
            settings.users_endpoint = endpoint;
        }
        if let Some(jitter) = duration(scan.launch_jitter) {
            settings.launch_jitter = jitter;
        }
    }

    if let Some(proxies) = file_config.proxies {
        if proxies.file.is_some() {
            settings.proxy_file = proxies.file;
        }
        if let Some(verify) = proxies.verify {
            settings.verify_proxies = verify;
        }
        if let Some(insecure) = proxies.insecure {
            settings.insecure = insecure;
        }
        if let Some(timeout) = duration(proxies.request_timeout) {
            settings.request_timeout = timeout;
        }
        if let Some(timeout) = duration(proxies.probe_timeout) {
            settings.probe_timeout = timeout;
        }
        if let Some(attempts) = proxies.refill_attempts {
            settings.refill_attempts = attempts;
        }
        if let Some(raw_lists) = proxies.raw_lists {
            settings.raw_lists = raw_lists;
        }
        if let Some(html_pages) = proxies.html_pages {
            settings.html_pages = html_pages;
        }
    }

    if let Some(retry) = file_config.retry {
        if let Some(attempts) = retry.max_attempts {
            settings.max_attempts = attempts_limit(attempts);
        }
        if let Some(elapsed) = duration(retry.max_elapsed) {
            settings.max_elapsed = Some(elapsed);
        }
        if let Some(delay) = duration(retry.rate_limit_delay) {
            settings.rate_limit_delay = delay;
        }
        if let Some(rotate_after) = retry.rotate_after {
            settings.rotate_after = rotate_after;
        }
    }

    settings
}

/// Apply RS_* environment values. The library has already validated them.
fn apply_environment_config(mut settings: RunSettings, env_config: &EnvConfig) -> RunSettings {
    if let Some(workers) = env_config.workers {
        settings.workers = workers;
    }
    if let Some(exclude_banned) = env_config.exclude_banned {
        settings.exclude_banned = exclude_banned;
    }
    if let Some(attempts) = env_config.max_attempts {
        settings.max_attempts = attempts_limit(attempts);
    }
    if let Some(timeout) = env_config.timeout.as_deref().and_then(parse_duration_string) {
        settings.request_timeout = timeout;
    }
    if env_config.proxy_file.is_some() {
        settings.proxy_file = env_config.proxy_file.clone();
    }
    if let Some(insecure) = env_config.insecure {
        settings.insecure = insecure;
    }

    settings
}

/// Apply CLI arguments to settings (highest precedence).
///
/// Boolean flags only ever switch a behavior on, so an absent flag never
/// overrides a config or environment value.
fn apply_cli_args(mut settings: RunSettings, args: &Args) -> RunSettings {
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    if args.no_auto_adjust {
        settings.auto_adjust = false;
    }
    if args.exclude_banned {
        settings.exclude_banned = true;
    }
    if let Some(attempts) = args.max_attempts {
        settings.max_attempts = attempts_limit(attempts);
    }
    if let Some(timeout) = args.timeout.as_deref().and_then(parse_duration_string) {
        settings.request_timeout = timeout;
    }
    if args.proxy_file.is_some() {
        settings.proxy_file = args.proxy_file.clone();
    }
    if args.verify_proxies {
        settings.verify_proxies = true;
    }
    if args.insecure_proxies {
        settings.insecure = true;
    }

    settings
}

fn render_results(
    records: &[MinimalUserRecord],
    args: &Args,
) -> Result<String, Box<dyn std::error::Error>> {
    if args.json {
        render_json_results(records)
    } else if args.csv {
        Ok(render_csv_results(records))
    } else {
        Ok(render_text_results(records))
    }
}

/// Render results in JSON format
fn render_json_results(
    records: &[MinimalUserRecord],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut json = serde_json::to_string_pretty(records)?;
    json.push('\n');
    Ok(json)
}

/// Render results in CSV format
fn render_csv_results(records: &[MinimalUserRecord]) -> String {
    let mut out = String::from("id,username,display_name,has_verified_badge\n");
    for record in records {
        out.push_str(&format!(
            "{},{},{},{}\n",
            record.id,
            csv_field(&record.username),
            csv_field(&record.display_name),
            record.has_verified_badge
        ));
    }
    out
}

/// Render results as `username | id` lines
fn render_text_results(records: &[MinimalUserRecord]) -> String {
    records
        .iter()
        .map(|record| format!("{} | {}\n", record.username, record.id))
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// rangescan/src/main.rs tests module
