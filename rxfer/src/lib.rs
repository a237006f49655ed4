//! Fast transfers between a local filesystem and S3-compatible object storage - `rxfer`
//!
//! `rxfer` moves large numbers of files and objects with a concurrent pipeline: enumerators list
//! the source into a bounded channel and a pool of workers transfers each item, retrying failed
//! attempts and reporting progress as it goes.
//!
//! # Commands
//!
//! ## rxfer cp - One-shot Copy
//!
//! ```bash
//! # upload a tree, keeping the directory name: s3://bkt/backup/photos/...
//! rxfer cp -r /data/photos s3://bkt/backup/ --progress
//!
//! # upload only the contents of a directory
//! rxfer cp -r /data/photos/ s3://bkt/photos/
//!
//! # download a single object into a directory
//! rxfer cp s3://bkt/reports/2024.csv /tmp/
//!
//! # server side copy, removing the source afterwards
//! rxfer cp -r s3://bkt/incoming/ s3://archive/incoming/ --move
//! ```
//!
//! ## rxfer sync - Incremental Synchronization
//!
//! `sync` compares each item with its destination and skips what is already there: by content
//! checksum when one is available, by size and modification time otherwise. With
//! `--snapshot-path` the outcome of every item is remembered across runs so an unchanged
//! source is skipped without contacting the destination at all.
//!
//! ```bash
//! rxfer sync -r /data/ s3://bkt/data/ --snapshot-path ~/.rxfer-snapshots
//!
//! # mirror: also delete destination entries that no longer exist at the source
//! rxfer sync -r /data/ s3://bkt/data/ --delete --backup-dir s3://bkt/trash/
//! ```
//!
//! # Failure Handling
//!
//! The pipeline is best-effort: an item that fails every attempt is recorded in the fail report
//! (`--fail-output-path`) and the run continues with the remaining items. `--fail-fast` cancels
//! the run on the first failure instead. Every attempt, retry and skip is written to the process
//! log (`--process-log-path`).
//!
//! # Exit Codes
//!
//! See [`ExitStatus`]: `0` when everything succeeded, `2` when the run completed with item,
//! listing or delete failures and `1` when it could not start or had to be aborted.
//!
//! # Architecture
//!
//! - [`location`]: local paths and `s3://bucket/key` addresses
//! - [`operation`]: the validated, immutable [`operation::TransferOperation`]
//! - [`enumerate`]: local walker, flat and hierarchical remote listers
//! - [`worker`]: single-item transfer with retry and backoff
//! - [`decision`]: the pure incremental skip decision
//! - [`snapshot`]: persistent sync state
//! - [`diff`] and [`delete`]: mirror planning and destination cleanup
//! - [`pipeline`]: the [`pipeline::PipelineContext`] and the run loop tying it all together
//! - [`process_log`]: process log and fail report writers

pub mod decision;
pub mod delete;
pub mod diff;
pub mod enumerate;
pub mod location;
pub mod operation;
pub mod pipeline;
pub mod process_log;
pub mod snapshot;
pub mod worker;

#[cfg(test)]
pub mod testutils;

pub use location::Location;
pub use pipeline::{PipelineContext, run};

/// Process exit status of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// the run completed but items, listings or deletions failed
    Failures,
    /// validation, setup or a fatal error stopped the run
    Aborted,
}

impl ExitStatus {
    /// `None` stands for a run that returned an error
    pub fn from_summary(summary: Option<&common::progress::Summary>) -> Self {
        match summary {
            Some(summary) if summary.counters.has_failures() => ExitStatus::Failures,
            Some(_) => ExitStatus::Success,
            None => ExitStatus::Aborted,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failures => 2,
            ExitStatus::Aborted => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::progress::{ItemOutcome, Monitor, Summary};

    #[test]
    fn exit_codes() {
        let monitor = Monitor::new();
        monitor.record(ItemOutcome::Transferred);
        let clean = Summary::from_monitor(&monitor, None);
        assert_eq!(ExitStatus::from_summary(Some(&clean)).code(), 0);
        monitor.record_list_error();
        let failed = Summary::from_monitor(&monitor, None);
        assert_eq!(ExitStatus::from_summary(Some(&failed)).code(), 2);
        assert_eq!(ExitStatus::from_summary(None).code(), 1);
    }
}
