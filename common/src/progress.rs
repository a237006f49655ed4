//! Transfer accounting shared by enumerators and workers
//!
//! The [`Monitor`] keeps every counter behind a single mutex so that a snapshot is always
//! internally consistent: at the end of a run `transferred + skipped + errors` equals the number
//! of descriptors handed to workers. Mutations raise a signal which the progress printer awaits
//! instead of polling on a timer.

use std::sync::{Mutex, PoisonError};

/// Point-in-time copy of the monitor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub scanned_count: u64,
    pub scanned_size: u64,
    pub scan_finished: bool,
    pub scan_failed: bool,
    /// items completed successfully, directory markers included
    pub transferred_count: u64,
    /// bytes moved so far; partial transfers that later fail are subtracted back out
    pub transferred_size: u64,
    pub directory_count: u64,
    pub skipped_count: u64,
    pub skipped_size: u64,
    pub error_count: u64,
    pub list_error_count: u64,
    pub deleted_count: u64,
    pub delete_error_count: u64,
}

impl Counters {
    /// Items that reached a terminal state
    pub fn completed(&self) -> u64 {
        self.transferred_count + self.skipped_count + self.error_count
    }

    pub fn has_failures(&self) -> bool {
        self.error_count > 0 || self.list_error_count > 0 || self.delete_error_count > 0
    }
}

/// Terminal state of one item, recorded exactly once per descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Transferred,
    Directory,
    Skipped { size: u64 },
    Failed,
}

#[derive(Debug)]
pub struct Monitor {
    counters: Mutex<Counters>,
    changed: tokio::sync::Notify,
    start_time: std::time::Instant,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            changed: tokio::sync::Notify::new(),
            start_time: std::time::Instant::now(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut counters);
        }
        self.signal();
    }

    pub fn add_scanned(&self, count: u64, size: u64) {
        self.update(|c| {
            c.scanned_count += count;
            c.scanned_size += size;
        });
    }

    pub fn finish_scan(&self, failed: bool) {
        self.update(|c| {
            c.scan_finished = true;
            c.scan_failed |= failed;
        });
    }

    /// Called from transfer listeners as bytes move
    pub fn add_transferred_bytes(&self, bytes: u64) {
        self.update(|c| c.transferred_size += bytes);
    }

    /// Undo bytes of an attempt that did not complete
    pub fn sub_transferred_bytes(&self, bytes: u64) {
        self.update(|c| c.transferred_size = c.transferred_size.saturating_sub(bytes));
    }

    pub fn record(&self, outcome: ItemOutcome) {
        self.update(|c| match outcome {
            ItemOutcome::Transferred => c.transferred_count += 1,
            ItemOutcome::Directory => {
                c.transferred_count += 1;
                c.directory_count += 1;
            }
            ItemOutcome::Skipped { size } => {
                c.skipped_count += 1;
                c.skipped_size += size;
            }
            ItemOutcome::Failed => c.error_count += 1,
        });
    }

    pub fn record_list_error(&self) {
        self.update(|c| c.list_error_count += 1);
    }

    pub fn record_delete(&self, ok: bool) {
        self.update(|c| {
            if ok {
                c.deleted_count += 1;
            } else {
                c.delete_error_count += 1;
            }
        });
    }

    pub fn snapshot(&self) -> Counters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Wake the progress printer; bursts of signals collapse into a single wakeup
    pub fn signal(&self) {
        self.changed.notify_one();
    }

    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Renders text progress updates, remembering the previous sample to compute current rates
pub struct ProgressPrinter<'a> {
    monitor: &'a Monitor,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(monitor: &'a Monitor) -> Self {
        Self {
            monitor,
            last_bytes: monitor.snapshot().transferred_size,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let now = std::time::Instant::now();
        let counters = self.monitor.snapshot();
        let total_secs = self.monitor.elapsed().as_secs_f64().max(f64::EPSILON);
        let curr_secs = (now - self.last_update).as_secs_f64().max(f64::EPSILON);
        let average_rate = counters.transferred_size as f64 / total_secs;
        let current_rate =
            counters.transferred_size.saturating_sub(self.last_bytes) as f64 / curr_secs;
        self.last_bytes = counters.transferred_size;
        self.last_update = now;
        let total = if counters.scan_finished {
            format!(
                "{} ({})",
                counters.scanned_count,
                bytesize::ByteSize(counters.scanned_size)
            )
        } else {
            format!(
                "{}+ ({}+)",
                counters.scanned_count,
                bytesize::ByteSize(counters.scanned_size)
            )
        };
        format!(
            "-----------------------\n\
            scanned:     {:>10}\n\
            transferred: {:>10} ({})\n\
            skipped:     {:>10}\n\
            failed:      {:>10}\n\
            average:     {:>10}/s\n\
            current:     {:>10}/s",
            total,
            counters.transferred_count,
            bytesize::ByteSize(counters.transferred_size),
            counters.skipped_count,
            counters.error_count,
            bytesize::ByteSize(average_rate as u64),
            bytesize::ByteSize(current_rate as u64),
        )
    }

    /// One-line form used as the progress bar message
    pub fn line(&self) -> String {
        let counters = self.monitor.snapshot();
        format!(
            "done {} | skipped {} | failed {} | {}",
            counters.transferred_count,
            counters.skipped_count,
            counters.error_count,
            bytesize::ByteSize(counters.transferred_size),
        )
    }
}

/// Final report printed at the end of every run
#[derive(Debug, Clone)]
pub struct Summary {
    pub counters: Counters,
    pub elapsed: std::time::Duration,
    /// directory holding the failure report, when one was written
    pub fail_output: Option<std::path::PathBuf>,
}

impl Summary {
    pub fn from_monitor(monitor: &Monitor, fail_output: Option<std::path::PathBuf>) -> Self {
        Self {
            counters: monitor.snapshot(),
            elapsed: monitor.elapsed(),
            fail_output,
        }
    }

    pub fn average_rate(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.counters.transferred_size as f64 / secs) as u64
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let c = &self.counters;
        writeln!(
            f,
            "scanned: {} ({})",
            c.scanned_count,
            bytesize::ByteSize(c.scanned_size)
        )?;
        writeln!(
            f,
            "transferred: {} ({}), directories: {}",
            c.transferred_count,
            bytesize::ByteSize(c.transferred_size),
            c.directory_count
        )?;
        writeln!(
            f,
            "skipped: {} ({})",
            c.skipped_count,
            bytesize::ByteSize(c.skipped_size)
        )?;
        writeln!(f, "failed: {}", c.error_count)?;
        if c.list_error_count > 0 {
            writeln!(f, "list errors: {}", c.list_error_count)?;
        }
        if c.deleted_count > 0 || c.delete_error_count > 0 {
            writeln!(
                f,
                "deleted: {}, delete errors: {}",
                c.deleted_count, c.delete_error_count
            )?;
        }
        let elapsed = std::time::Duration::from_millis(self.elapsed.as_millis() as u64);
        writeln!(f, "elapsed: {}", humantime::format_duration(elapsed))?;
        write!(f, "average speed: {}/s", bytesize::ByteSize(self.average_rate()))?;
        if let (true, Some(path)) = (c.has_failures(), &self.fail_output) {
            write!(
                f,
                "\nsome items failed, see the report in {}",
                path.display()
            )?;
        }
        Ok(())
    }
}
