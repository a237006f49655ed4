//! Incremental sync decisions
//!
//! [`decide`] is a pure function of the previous snapshot record, the current source state and
//! the current destination state. Workers gather those inputs (stat, HEAD, snapshot lookup) and
//! act on the returned [`Decision`]; nothing in here performs I/O.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceState {
    pub size: u64,
    /// unix seconds
    pub last_modified: i64,
    /// lowercase hex MD5 of the content when known
    pub checksum: Option<String>,
    pub is_dir: bool,
    /// the diff pass already found an identical destination entry
    pub marked_skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationState {
    /// not looked up, no comparison possible
    Unchecked,
    Missing,
    Present {
        size: u64,
        last_modified: i64,
        checksum: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub ignore_existing: bool,
    /// transfer only when the source is newer than the destination
    pub update: bool,
    /// compare content checksums instead of size and modification time
    pub checksum: bool,
}

impl DecisionPolicy {
    pub fn from_operation(operation: &crate::operation::TransferOperation) -> Self {
        Self {
            ignore_existing: operation.ignore_existing,
            update: operation.update,
            checksum: !operation.disable_crc64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MarkedByDiff,
    SnapshotMatch,
    IgnoreExisting,
    NotNewer,
    ChecksumMatch,
    /// same size and the source is not newer
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReason {
    NoComparison,
    DestinationMissing,
    Newer,
    ChecksumMismatch,
    SizeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Transfer(TransferReason),
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip(_))
    }

    /// Skips that establish the destination as identical; the snapshot is refreshed for these
    pub fn updates_snapshot(&self) -> bool {
        matches!(
            self,
            Decision::Skip(
                SkipReason::IgnoreExisting
                    | SkipReason::NotNewer
                    | SkipReason::ChecksumMatch
                    | SkipReason::Unchanged
            )
        )
    }
}

fn snapshot_matches(previous: Option<i64>, source: &SourceState, policy: &DecisionPolicy) -> bool {
    !policy.ignore_existing && previous == Some(source.last_modified)
}

/// Whether [`decide`] could use the destination state for this source
pub fn needs_destination(
    previous: Option<i64>,
    source: &SourceState,
    policy: &DecisionPolicy,
) -> bool {
    !(source.marked_skip || source.is_dir || snapshot_matches(previous, source, policy))
}

/// Whether the comparison would look at content checksums
pub fn needs_checksum(policy: &DecisionPolicy) -> bool {
    policy.checksum && !policy.ignore_existing && !policy.update
}

/// Only whole-object MD5 digests compare; multipart entity tags carry a `-N` suffix
pub fn usable_checksum(etag: Option<&str>) -> Option<String> {
    etag.filter(|etag| etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase)
}

pub fn decide(
    previous: Option<i64>,
    source: &SourceState,
    destination: &DestinationState,
    policy: &DecisionPolicy,
) -> Decision {
    if source.marked_skip {
        return Decision::Skip(SkipReason::MarkedByDiff);
    }
    if source.is_dir {
        return Decision::Transfer(TransferReason::NoComparison);
    }
    if snapshot_matches(previous, source, policy) {
        return Decision::Skip(SkipReason::SnapshotMatch);
    }
    let (size, last_modified, checksum) = match destination {
        DestinationState::Unchecked => return Decision::Transfer(TransferReason::NoComparison),
        DestinationState::Missing => return Decision::Transfer(TransferReason::DestinationMissing),
        DestinationState::Present {
            size,
            last_modified,
            checksum,
        } => (*size, *last_modified, checksum),
    };
    if policy.ignore_existing {
        return Decision::Skip(SkipReason::IgnoreExisting);
    }
    if policy.update {
        return if source.last_modified > last_modified {
            Decision::Transfer(TransferReason::Newer)
        } else {
            Decision::Skip(SkipReason::NotNewer)
        };
    }
    if source.size != size {
        return Decision::Transfer(TransferReason::SizeMismatch);
    }
    if let (true, Some(src), Some(dst)) = (policy.checksum, &source.checksum, checksum) {
        return if src.eq_ignore_ascii_case(dst) {
            Decision::Skip(SkipReason::ChecksumMatch)
        } else {
            Decision::Transfer(TransferReason::ChecksumMismatch)
        };
    }
    if source.last_modified > last_modified {
        Decision::Transfer(TransferReason::Newer)
    } else {
        Decision::Skip(SkipReason::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(size: u64, last_modified: i64) -> SourceState {
        SourceState {
            size,
            last_modified,
            checksum: None,
            is_dir: false,
            marked_skip: false,
        }
    }

    fn present(size: u64, last_modified: i64) -> DestinationState {
        DestinationState::Present {
            size,
            last_modified,
            checksum: None,
        }
    }

    #[test]
    fn missing_destination_is_transferred() {
        let policy = DecisionPolicy {
            ignore_existing: true,
            ..Default::default()
        };
        assert_eq!(
            decide(None, &source(1, 1), &DestinationState::Missing, &policy),
            Decision::Transfer(TransferReason::DestinationMissing)
        );
    }

    #[test]
    fn ignore_existing_skips_any_present_destination() {
        let policy = DecisionPolicy {
            ignore_existing: true,
            ..Default::default()
        };
        let decision = decide(Some(5), &source(1, 10), &present(99, 0), &policy);
        assert_eq!(decision, Decision::Skip(SkipReason::IgnoreExisting));
        assert!(decision.updates_snapshot());
    }

    #[test]
    fn snapshot_match_needs_no_destination() {
        let policy = DecisionPolicy::default();
        let src = source(1, 10);
        assert!(!needs_destination(Some(10), &src, &policy));
        assert!(needs_destination(Some(9), &src, &policy));
        let decision = decide(Some(10), &src, &DestinationState::Unchecked, &policy);
        assert_eq!(decision, Decision::Skip(SkipReason::SnapshotMatch));
        assert!(!decision.updates_snapshot());
    }

    #[test]
    fn update_mode_compares_times() {
        let policy = DecisionPolicy {
            update: true,
            checksum: true,
            ..Default::default()
        };
        assert_eq!(
            decide(None, &source(1, 20), &present(1, 10), &policy),
            Decision::Transfer(TransferReason::Newer)
        );
        assert_eq!(
            decide(None, &source(5, 10), &present(1, 10), &policy),
            Decision::Skip(SkipReason::NotNewer)
        );
        assert!(!needs_checksum(&policy));
    }

    #[test]
    fn checksums_decide_when_available() {
        let policy = DecisionPolicy {
            checksum: true,
            ..Default::default()
        };
        let mut src = source(3, 50);
        src.checksum = Some("ABC".to_string());
        let same = DestinationState::Present {
            size: 3,
            last_modified: 10,
            checksum: Some("abc".to_string()),
        };
        assert_eq!(
            decide(None, &src, &same, &policy),
            Decision::Skip(SkipReason::ChecksumMatch)
        );
        let other = DestinationState::Present {
            size: 3,
            last_modified: 10,
            checksum: Some("def".to_string()),
        };
        assert_eq!(
            decide(None, &src, &other, &policy),
            Decision::Transfer(TransferReason::ChecksumMismatch)
        );
        // no destination digest, falls back to size and time
        assert_eq!(
            decide(None, &src, &present(3, 10), &policy),
            Decision::Transfer(TransferReason::Newer)
        );
    }

    #[test]
    fn size_and_time_fallback() {
        let policy = DecisionPolicy::default();
        assert_eq!(
            decide(None, &source(3, 10), &present(4, 10), &policy),
            Decision::Transfer(TransferReason::SizeMismatch)
        );
        let decision = decide(None, &source(3, 10), &present(3, 20), &policy);
        assert_eq!(decision, Decision::Skip(SkipReason::Unchanged));
        assert!(decision.updates_snapshot());
    }

    #[test]
    fn directories_and_marked_items() {
        let policy = DecisionPolicy::default();
        let mut dir = source(0, 1);
        dir.is_dir = true;
        assert_eq!(
            decide(Some(1), &dir, &present(0, 1), &policy),
            Decision::Transfer(TransferReason::NoComparison)
        );
        let mut marked = source(1, 1);
        marked.marked_skip = true;
        assert!(!needs_destination(None, &marked, &policy));
        let decision = decide(None, &marked, &DestinationState::Unchecked, &policy);
        assert_eq!(decision, Decision::Skip(SkipReason::MarkedByDiff));
        assert!(!decision.updates_snapshot());
    }

    #[test]
    fn multipart_etags_are_not_checksums() {
        assert_eq!(
            usable_checksum(Some("D41D8CD98F00B204E9800998ECF8427E")).as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(usable_checksum(Some("abc-3")), None);
        assert_eq!(usable_checksum(None), None);
    }
}
