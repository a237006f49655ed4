//! Append-only run logs: the per-attempt process log and the failure report
//!
//! Each log is owned by one writer task which is the only holder of the file. Workers send whole
//! batches of lines (all attempts of one item) over a channel, so lines of different items never
//! interleave. The file lives in `<base>/<run timestamp>/` and is only created once the first
//! batch arrives.

use anyhow::Context;
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

pub const PROCESS_LOG_FILE: &str = "process.log";
pub const FAIL_REPORT_FILE: &str = "error.report";

/// Directory name of one run, shared by every log the run writes
pub fn run_stamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Timestamp prefix of a log line
pub fn line_time() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub struct LogSink {
    path: Option<std::path::PathBuf>,
    sender: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Vec<String>>>>,
    writer: Mutex<Option<tokio::task::JoinHandle<anyhow::Result<bool>>>>,
}

async fn write_lines(
    path: std::path::PathBuf,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<Vec<String>>,
) -> anyhow::Result<bool> {
    let mut writer = None;
    while let Some(lines) = receiver.recv().await {
        if writer.is_none() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create log directory {:?}", parent))?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("cannot open log file {:?}", path))?;
            writer = Some(tokio::io::BufWriter::new(file));
        }
        if let Some(writer) = writer.as_mut() {
            for line in lines {
                writer
                    .write_all(line.as_bytes())
                    .await
                    .with_context(|| format!("failed writing {:?}", path))?;
                writer.write_all(b"\n").await?;
            }
        }
    }
    match writer {
        Some(mut writer) => {
            writer
                .flush()
                .await
                .with_context(|| format!("failed flushing {:?}", path))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

impl LogSink {
    /// Sink that drops everything
    pub fn disabled() -> Self {
        Self {
            path: None,
            sender: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Start the writer task for `<base>/<stamp>/<file_name>`
    pub fn start(base: &std::path::Path, stamp: &str, file_name: &str) -> Self {
        let path = base.join(stamp).join(file_name);
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(path.clone(), receiver));
        Self {
            path: Some(path),
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn write(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // the writer only goes away after failing, which finish() reports
            let _ = sender.send(lines);
        }
    }

    pub fn line(&self, line: String) {
        self.write(vec![line]);
    }

    /// Close the channel and wait until everything is on disk
    ///
    /// Returns the log file path if anything was written.
    pub async fn finish(&self) -> Option<std::path::PathBuf> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match writer.await {
            Ok(Ok(true)) => self.path.clone(),
            Ok(Ok(false)) => None,
            Ok(Err(error)) => {
                tracing::warn!("log writer failed: {:#}", error);
                None
            }
            Err(error) => {
                tracing::warn!("log writer task panicked: {}", error);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn batches_are_written_in_order() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let sink = LogSink::start(tmp.path(), "20240101_000000", PROCESS_LOG_FILE);
        sink.write(vec!["a".to_string(), "b".to_string()]);
        sink.line("c".to_string());
        let path = sink.finish().await.expect("log was written");
        assert_eq!(path, tmp.path().join("20240101_000000").join(PROCESS_LOG_FILE));
        assert_eq!(std::fs::read_to_string(path)?, "a\nb\nc\n");
        // late lines are dropped
        sink.line("d".to_string());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn nothing_written_creates_nothing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let sink = LogSink::start(tmp.path(), "stamp", FAIL_REPORT_FILE);
        assert!(sink.finish().await.is_none());
        assert!(!tmp.path().join("stamp").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn disabled_sink_ignores_lines() -> anyhow::Result<()> {
        let sink = LogSink::disabled();
        assert!(!sink.is_enabled());
        sink.line("x".to_string());
        assert!(sink.finish().await.is_none());
        Ok(())
    }

    #[test]
    fn stamps_have_fixed_width() {
        assert_eq!(run_stamp().len(), "20240101_000000".len());
        assert_eq!(line_time().len(), "2024-01-01 00:00:00".len());
    }
}
