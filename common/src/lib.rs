//! Shared plumbing for the rxfer tools
//!
//! - [`config`]: plain configuration values filled in from the command line
//! - [`filter`]: include/exclude glob filters applied to relative keys
//! - [`progress`]: the transfer [`progress::Monitor`], text rendering and the final summary
//! - [`run`]: builds the tokio runtime, installs tracing, drives the progress display and
//!   executes the command future
//! - [`Aborted`]: a command error that still carries the report of the work done before it

use anyhow::{Context, anyhow};
use std::io::IsTerminal;

pub mod config;
pub mod filter;
pub mod progress;

pub use config::{OutputConfig, RateLimitConfig, RuntimeConfig, TracingConfig};

/// A command stopped by `error` after producing `report`
///
/// [`run`] prints the report as it would for a successful command before reporting the failure.
#[derive(Debug)]
pub struct Aborted<Report> {
    pub error: anyhow::Error,
    pub report: Report,
}

impl<Report> Aborted<Report> {
    pub fn new(error: anyhow::Error, report: Report) -> Self {
        Self { error, report }
    }
}

impl<Report> std::fmt::Display for Aborted<Report> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl<Report: std::fmt::Debug> std::error::Error for Aborted<Report> {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// human readable minimum delay between two refreshes, e.g. "200ms"
    pub progress_delay: Option<String>,
    pub monitor: std::sync::Arc<progress::Monitor>,
}

impl ProgressSettings {
    fn resolved_type(&self) -> ProgressType {
        match self.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }

    fn delay(&self, progress_type: ProgressType) -> anyhow::Result<std::time::Duration> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid --progress-delay value: {delay}")),
            None if progress_type == ProgressType::ProgressBar => {
                Ok(std::time::Duration::from_millis(200))
            }
            None => Ok(std::time::Duration::from_secs(10)),
        }
    }
}

enum ProgressView {
    Bar(indicatif::ProgressBar),
    Text,
}

impl ProgressView {
    fn new(progress_type: ProgressType) -> anyhow::Result<Self> {
        if progress_type != ProgressType::ProgressBar {
            return Ok(ProgressView::Text);
        }
        let bar = indicatif::ProgressBar::new(0);
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "[{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} {msg}",
            )
            .map_err(|err| anyhow!("invalid progress template: {err}"))?,
        );
        Ok(ProgressView::Bar(bar))
    }

    fn render(&self, printer: &mut progress::ProgressPrinter, monitor: &progress::Monitor) {
        match self {
            ProgressView::Bar(bar) => {
                let counters = monitor.snapshot();
                bar.set_length(counters.scanned_size);
                bar.set_position(counters.transferred_size + counters.skipped_size);
                bar.set_message(printer.line());
            }
            ProgressView::Text => eprintln!("{}", printer.print()),
        }
    }

    fn finish(&self) {
        if let ProgressView::Bar(bar) = self {
            bar.finish_and_clear();
        }
    }
}

/// Refresh the display whenever the monitor signals, no more often than `delay`
async fn progress_loop(
    settings: ProgressSettings,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let progress_type = settings.resolved_type();
    let delay = settings.delay(progress_type)?;
    let display = ProgressView::new(progress_type)?;
    let monitor = settings.monitor.clone();
    let mut printer = progress::ProgressPrinter::new(&monitor);
    let mut last_render = std::time::Instant::now();
    loop {
        tokio::select! {
            _ = monitor.changed() => {}
            _ = &mut stop => break,
        }
        let wait = delay.saturating_sub(last_render.elapsed());
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut stop => break,
            }
        }
        display.render(&mut printer, &monitor);
        last_render = std::time::Instant::now();
    }
    display.finish();
    Ok(())
}

fn init_tracing(output: &OutputConfig, tracing: &TracingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.default_directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match &tracing.debug_log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create debug log file {path}"))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    res.map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

/// Run a command to completion on a freshly built runtime
///
/// Returns `None` when setup failed or the command returned an error (which has already been
/// logged); otherwise the command's report, which is printed unless output is quiet. A command
/// failing with [`Aborted`] gets its partial report printed the same way.
pub fn run<Fut, Report>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Report>
where
    Fut: std::future::Future<Output = anyhow::Result<Report>>,
    Report: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    if let Err(error) = init_tracing(&output, &tracing) {
        eprintln!("{:#}", error);
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!("failed to build tokio runtime: {:#}", error);
            return None;
        }
    };
    let res = rt.block_on(async move {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let printer = progress.map(|settings| tokio::spawn(progress_loop(settings, stop_rx)));
        let res = func().await;
        // receiver may already be gone if the printer failed to start
        let _ = stop_tx.send(());
        if let Some(printer) = printer {
            match printer.await {
                Ok(Err(error)) => tracing::warn!("progress display failed: {:#}", error),
                Err(error) => tracing::warn!("progress display task panicked: {}", error),
                Ok(Ok(())) => {}
            }
        }
        res
    });
    let print = |report: &Report| {
        if !output.quiet || output.print_summary {
            println!("{report}");
        }
    };
    match res {
        Ok(report) => {
            print(&report);
            Some(report)
        }
        Err(error) => {
            match error.downcast::<Aborted<Report>>() {
                Ok(aborted) => {
                    tracing::error!("{:#}", aborted.error);
                    print(&aborted.report);
                }
                Err(error) => tracing::error!("{:#}", error),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_keeps_its_report() {
        let error = anyhow::Error::new(Aborted::new(
            anyhow!("disk full").context("cannot record state"),
            42u64,
        ));
        assert_eq!(format!("{error:#}"), "cannot record state: disk full");
        let aborted = error.downcast::<Aborted<u64>>().unwrap();
        assert_eq!(aborted.report, 42);
        let other = anyhow!("plain failure");
        assert!(other.downcast::<Aborted<u64>>().is_err());
    }
}
