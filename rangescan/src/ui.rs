//! Terminal display logic for the rangescan CLI.
//!
//! This module handles the stderr side of a run: the progress spinner,
//! the header and the end-of-run summary. Results themselves go to stdout
//! or the output file so they can be piped. Uses only the `console` crate.

use console::{style, Term};
use rangescan_lib::{ProgressSnapshot, ScanProgress, ScanReport, ScanStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Spinner ──────────────────────────────────────────────────────────────────

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// What the spinner shows next to its frame.
enum SpinnerText {
    Fixed(String),
    Progress(Arc<ScanProgress>),
}

/// An async braille-dot spinner that writes to stderr so stdout stays clean.
pub struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Spinner {
    /// Start a spinner with a fixed message (e.g. "Verifying 300 proxies...").
    pub fn start(message: String, enabled: bool) -> Self {
        Self::spawn(SpinnerText::Fixed(message), enabled)
    }

    /// Start a spinner that follows the live batch counters of a scan.
    pub fn track(progress: Arc<ScanProgress>, enabled: bool) -> Self {
        Self::spawn(SpinnerText::Progress(progress), enabled)
    }

    fn spawn(text: SpinnerText, enabled: bool) -> Self {
        let running = Arc::new(AtomicBool::new(enabled));
        if !enabled {
            return Self {
                running,
                handle: None,
            };
        }

        let running_clone = running.clone();
        let handle = tokio::spawn(async move {
            let term = Term::stderr();
            let mut idx = 0usize;
            while running_clone.load(Ordering::Relaxed) {
                let frame = SPINNER_FRAMES[idx % SPINNER_FRAMES.len()];
                let message = match &text {
                    SpinnerText::Fixed(message) => message.clone(),
                    SpinnerText::Progress(progress) => format_progress(&progress.snapshot()),
                };
                let _ = term.clear_line();
                let _ = term.write_str(&format!("{} {}", style(frame).cyan(), message));
                idx += 1;
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            let _ = term.clear_line();
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop the spinner and clear the line.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

/// One-line progress text, e.g. `[12/40] batches | 530 users | 8 workers`.
pub fn format_progress(snapshot: &ProgressSnapshot) -> String {
    let mut text = format!(
        "[{}/{}] batches | {} user{} | {} worker{}",
        snapshot.batches_finished(),
        snapshot.batches_total,
        snapshot.records,
        plural(snapshot.records),
        snapshot.workers_running,
        plural(snapshot.workers_running),
    );
    if snapshot.batches_failed > 0 {
        text.push_str(&format!(" | {} failed", snapshot.batches_failed));
    }
    text
}

// ── Header ───────────────────────────────────────────────────────────────────

/// Print a styled header at the start of a run.
///
/// The worker count is the requested one; the summary shows how many ran
/// after auto-adjustment.
pub fn print_header(low: i64, high: i64, requested_workers: usize, proxies: usize) {
    let span = high - low;
    eprintln!(
        "{} {} {}",
        style("rangescan").bold(),
        style(format!("v{}", env!("CARGO_PKG_VERSION"))).dim(),
        style(format!(
            "- Scanning {} identifier{} [{}, {})",
            span,
            if span == 1 { "" } else { "s" },
            low,
            high
        ))
        .dim(),
    );
    eprintln!("{}", style(header_details(requested_workers, proxies)).dim());
    eprintln!();
}

fn header_details(requested_workers: usize, proxies: usize) -> String {
    format!(
        "Workers requested: {} | Proxies: {}",
        requested_workers, proxies
    )
}

// ── Summary ──────────────────────────────────────────────────────────────────

/// Print the end-of-run summary with colored counts.
pub fn print_summary(report: &ScanReport) {
    let stats: &ScanStats = &report.stats;

    eprintln!(
        "  {}",
        style("────────────────────────────────────────────────────").dim()
    );
    eprintln!(
        "  {} user{} found in {:.1}s  {}  {}  {}  {}",
        style(report.records.len()).bold(),
        plural(report.records.len()),
        report.elapsed.as_secs_f64(),
        style("|").dim(),
        style(format!("{} batches ok", stats.batches_ok)).green(),
        style("|").dim(),
        if stats.batches_failed == 0 {
            style(format!("{} failed", stats.batches_failed)).dim()
        } else {
            style(format!("{} failed", stats.batches_failed)).red()
        },
    );
    eprintln!(
        "  {}",
        style(format!(
            "{} attempts | {} rate-limit hit{} | {} rotation{} | {} worker{}",
            stats.attempts,
            stats.rate_limited,
            plural(stats.rate_limited as usize),
            stats.rotations,
            plural(stats.rotations as usize),
            report.workers,
            plural(report.workers),
        ))
        .dim()
    );

    if report.cancelled {
        eprintln!(
            "  {}",
            style("Interrupted: results below are partial.").yellow()
        );
    }
}

/// Print failed batch ranges, at most `max_show` of them.
pub fn print_failures(report: &ScanReport, max_show: usize) {
    if report.failures.is_empty() {
        return;
    }

    eprintln!(
        "  {}",
        style(format!(
            "{} identifier{} could not be verified:",
            report.failed_identifiers(),
            plural(report.failed_identifiers())
        ))
        .yellow()
    );

    for failure in report.failures.iter().take(max_show) {
        eprintln!(
            "  {} {}..={}  {}",
            style("•").dim(),
            failure.first_id,
            failure.last_id,
            style(&failure.error).dim(),
        );
    }

    if report.failures.len() > max_show {
        eprintln!(
            "  {} ... and {} more",
            style("•").dim(),
            report.failures.len() - max_show
        );
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
