use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::instrument;

use rxfer::operation::{self, Command, EncryptionArgs, TransferOperation};
use rxfer::process_log::{FAIL_REPORT_FILE, LogSink, PROCESS_LOG_FILE, run_stamp};
use rxfer::{ExitStatus, Location, PipelineContext};

#[derive(Parser, Debug)]
#[command(
    name = "rxfer",
    version,
    about = "Copy and synchronize files between a local filesystem and S3-compatible object storage",
    long_about = "`rxfer` moves large numbers of files and objects between a local filesystem and S3-compatible \
object storage (and between two buckets) using a concurrent, retrying pipeline.

Remote locations are written as `s3://bucket/key` (`cos://` is accepted as well). Exactly one side of \
an upload or download is local; server side copies have two remote sides.

EXAMPLES:
    # Upload a directory tree, keeping its name: s3://bkt/backup/photos/...
    rxfer cp -r /data/photos s3://bkt/backup/ --progress

    # Download one object into a local directory
    rxfer cp s3://bkt/reports/2024.csv /tmp/

    # Incremental upload remembering what was already sent
    rxfer sync -r /data/ s3://bkt/data/ --snapshot-path ~/.rxfer-snapshots

    # Mirror a bucket prefix locally, moving deleted entries aside first
    rxfer sync -r s3://bkt/data/ /srv/data/ --delete --backup-dir /srv/trash/ --force

Exit status is 0 on success, 2 when some items failed and 1 when the run could not start or was aborted."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy files and objects, optionally recursively
    #[command(alias = "copy")]
    Cp(Args),
    /// Copy only what differs at the destination, optionally deleting what the source no longer has
    Sync(Args),
}

#[derive(clap::Args, Debug, Clone)]
struct Args {
    /// Source: a local path or s3://bucket/key
    #[arg(value_name = "SOURCE")]
    source: String,

    /// Destination: a local path or s3://bucket/key
    #[arg(value_name = "DESTINATION")]
    destination: String,

    // Selection
    /// Transfer a whole directory or key prefix
    #[arg(short, long, help_heading = "Selection")]
    recursive: bool,

    /// Only transfer relative keys matching PATTERN (may be repeated)
    ///
    /// Glob syntax: `*` within a path component, `**` across components, a trailing `/` matches
    /// directories only and a leading `/` anchors the pattern to the transfer root.
    #[arg(long, value_name = "PATTERN", help_heading = "Selection")]
    include: Vec<String>,

    /// Skip relative keys matching PATTERN (may be repeated, evaluated after --include)
    #[arg(long, value_name = "PATTERN", help_heading = "Selection")]
    exclude: Vec<String>,

    /// Read include/exclude rules from a file
    ///
    /// One rule per line: `+ PATTERN` includes, `- PATTERN` excludes, `#` starts a comment.
    #[arg(long, value_name = "PATH", help_heading = "Selection")]
    filter_file: Option<std::path::PathBuf>,

    /// Do not descend below the first level of the source
    #[arg(long, help_heading = "Selection")]
    only_current_dir: bool,

    /// Skip symbolic links entirely when uploading
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL", help_heading = "Selection")]
    disable_all_symlink: bool,

    /// Follow symbolic links pointing at directories (requires --disable-all-symlink=false)
    #[arg(long, help_heading = "Selection")]
    enable_symlink_dir: bool,

    /// Do not create directory marker objects when uploading
    #[arg(long, help_heading = "Selection")]
    skip_dir: bool,

    /// Skip every item that already exists at the destination (sync only)
    #[arg(long, help_heading = "Selection")]
    ignore_existing: bool,

    /// Skip empty objects when downloading
    #[arg(long, help_heading = "Selection")]
    ignore_empty_file: bool,

    /// Transfer this version of a single source object
    #[arg(long, value_name = "ID", help_heading = "Selection")]
    version_id: Option<String>,

    // Sync
    /// Directory holding the persistent sync state (sync only)
    #[arg(long, value_name = "PATH", help_heading = "Sync")]
    snapshot_path: Option<std::path::PathBuf>,

    /// Delete destination entries missing from the source (sync only, requires --recursive)
    #[arg(long, help_heading = "Sync")]
    delete: bool,

    /// Copy deleted entries here before removing them (requires --delete)
    #[arg(long, value_name = "LOCATION", help_heading = "Sync")]
    backup_dir: Option<String>,

    /// Only transfer items newer than their destination (sync only)
    #[arg(long, help_heading = "Sync")]
    update: bool,

    /// Do not ask for confirmation before deleting
    #[arg(short, long, help_heading = "Sync")]
    force: bool,

    /// Largest number of entries a side may have for --delete
    #[arg(
        long,
        default_value_t = operation::DEFAULT_MAX_SYNC_ENTRIES,
        value_name = "N",
        help_heading = "Sync"
    )]
    max_sync_entries: usize,

    /// Delete each source object after it was copied (bucket to bucket only)
    #[arg(long = "move", help_heading = "Sync")]
    move_source: bool,

    // Performance & throttling
    /// Number of items transferred concurrently
    #[arg(
        long,
        default_value = "3",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    routines: usize,

    /// Concurrent parts per multipart transfer (default: derived from the number of parts)
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    thread_num: Option<usize>,

    /// Part size for multipart transfers, between 1MiB and 5GiB
    #[arg(
        long,
        default_value = "32MiB",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    part_size: bytesize::ByteSize,

    /// Bandwidth limit in MB/s, between 0.1 and 100
    #[arg(long, value_name = "MBPS", help_heading = "Performance & throttling")]
    rate_limiting: Option<f32>,

    /// Size of the shared connection pool (0 = one per routine)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    long_links_nums: usize,

    /// Do not keep connections alive between requests
    #[arg(long, help_heading = "Performance & throttling")]
    disable_long_links: bool,

    // Retry
    /// Retries of throttled requests
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Retry")]
    retry_num: u32,

    /// Retries of a failed item, between 0 and 100
    #[arg(long, default_value = "5", value_name = "N", help_heading = "Retry")]
    err_retry_num: u32,

    /// Seconds between item retries, between 0 and 10 (0 = random 1-10s)
    #[arg(long, default_value = "0", value_name = "SECS", help_heading = "Retry")]
    err_retry_interval: u64,

    /// Cancel the whole run on the first failed item
    #[arg(long, help_heading = "Retry")]
    fail_fast: bool,

    // Integrity
    /// Decide what to sync by size and modification time only, never by content checksum
    #[arg(long, help_heading = "Integrity")]
    disable_crc64: bool,

    /// Only send and validate request checksums where the service requires them
    #[arg(long, help_heading = "Integrity")]
    disable_checksum: bool,

    // Security & metadata
    /// Storage class of written objects
    #[arg(long, value_name = "CLASS", help_heading = "Security & metadata")]
    storage_class: Option<String>,

    /// Canned ACL of written objects
    #[arg(long, value_name = "ACL", help_heading = "Security & metadata")]
    acl: Option<String>,

    /// Grantees allowed to read written objects, e.g. `id="100000000001",id="100000000002"`
    #[arg(long, value_name = "GRANTEES", help_heading = "Security & metadata")]
    grant_read: Option<String>,

    /// Grantees allowed to read the ACL of written objects
    #[arg(long, value_name = "GRANTEES", help_heading = "Security & metadata")]
    grant_read_acp: Option<String>,

    /// Grantees allowed to change the ACL of written objects
    #[arg(long, value_name = "GRANTEES", help_heading = "Security & metadata")]
    grant_write_acp: Option<String>,

    /// Grantees given full control of written objects
    #[arg(long, value_name = "GRANTEES", help_heading = "Security & metadata")]
    grant_full_control: Option<String>,

    /// Object tags, `key1=value1&key2=value2`
    #[arg(long, value_name = "TAGS", help_heading = "Security & metadata")]
    tags: Option<String>,

    /// Object metadata, `Header:value#x-cos-meta-key:value`
    #[arg(long = "meta", value_name = "META", help_heading = "Security & metadata")]
    meta: Option<String>,

    /// Never overwrite an existing destination object
    #[arg(long, help_heading = "Security & metadata")]
    forbid_overwrite: bool,

    /// Server side encryption: SSE-COS, SSE-S3, SSE-KMS or SSE-C
    #[arg(long, value_name = "TYPE", help_heading = "Security & metadata")]
    encryption_type: Option<String>,

    /// Algorithm for SSE-COS/SSE-S3/SSE-KMS
    #[arg(long, value_name = "ALGO", help_heading = "Security & metadata")]
    server_side_encryption: Option<String>,

    /// Customer key algorithm for SSE-C
    #[arg(long, value_name = "ALGO", help_heading = "Security & metadata")]
    sse_customer_algo: Option<String>,

    /// Base64 customer key for SSE-C
    #[arg(long, value_name = "KEY", help_heading = "Security & metadata")]
    sse_customer_key: Option<String>,

    /// Base64 MD5 of the customer key for SSE-C
    #[arg(long, value_name = "MD5", help_heading = "Security & metadata")]
    sse_customer_key_md5: Option<String>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for the progress bar and 10s for text updates. If specified, --progress
    /// flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end, even with --quiet
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Write failed items to a fail report
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL", help_heading = "Progress & output")]
    fail_output: bool,

    /// Directory of the fail report, a timestamped subdirectory is created per run
    #[arg(
        long,
        default_value = "rxfer_output",
        value_name = "PATH",
        help_heading = "Progress & output"
    )]
    fail_output_path: std::path::PathBuf,

    /// Write every attempt, retry and skip to a process log
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL", help_heading = "Progress & output")]
    process_log: bool,

    /// Directory of the process log, a timestamped subdirectory is created per run
    #[arg(
        long,
        default_value = "rxfer_output",
        value_name = "PATH",
        help_heading = "Progress & output"
    )]
    process_log_path: std::path::PathBuf,

    // Credentials
    /// Profile file (default: ~/.rxfer.json)
    #[arg(short = 'c', long, value_name = "PATH", help_heading = "Credentials")]
    config_path: Option<std::path::PathBuf>,

    /// Secret id, overrides the profile
    #[arg(long, value_name = "ID", help_heading = "Credentials")]
    secret_id: Option<String>,

    /// Secret key, overrides the profile
    #[arg(long, value_name = "KEY", help_heading = "Credentials")]
    secret_key: Option<String>,

    /// Session token for temporary credentials
    #[arg(long, value_name = "TOKEN", help_heading = "Credentials")]
    session_token: Option<String>,

    /// Endpoint, overrides the profile
    #[arg(short = 'e', long, value_name = "URL", help_heading = "Credentials")]
    endpoint: Option<String>,

    /// Set to false to switch to the fallback endpoint when the primary one keeps failing
    #[arg(long, value_name = "BOOL", help_heading = "Credentials")]
    close_auto_switch_host: Option<bool>,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Write the diagnostic log to a file instead of stderr
    #[arg(long, value_name = "PATH", help_heading = "Advanced settings")]
    debug_log_file: Option<String>,
}

fn build_operation(command: Command, args: &Args) -> anyhow::Result<TransferOperation> {
    let source = Location::parse(&args.source)?;
    let destination = Location::parse(&args.destination)?;
    let mut operation = TransferOperation::new(command, source, destination)?;
    let mut filters = match &args.filter_file {
        Some(path) => common::filter::FilterSettings::from_file(path)?,
        None => common::filter::FilterSettings::new(),
    };
    for pattern in &args.include {
        filters.add_include(pattern)?;
    }
    for pattern in &args.exclude {
        filters.add_exclude(pattern)?;
    }
    operation.recursive = args.recursive;
    operation.filters = filters;
    operation.only_current_dir = args.only_current_dir;
    operation.symlinks =
        operation::SymlinkPolicy::from_flags(args.disable_all_symlink, args.enable_symlink_dir);
    operation.skip_dir = args.skip_dir;
    operation.ignore_existing = args.ignore_existing;
    operation.ignore_empty_file = args.ignore_empty_file;
    operation.version_id = args.version_id.clone();
    operation.routines = args.routines;
    operation.thread_num = args.thread_num;
    operation.part_size = args.part_size.0;
    operation.rate_limit = common::RateLimitConfig {
        megabytes_per_second: args.rate_limiting,
    };
    operation.retry_num = args.retry_num;
    operation.err_retry_num = args.err_retry_num;
    operation.err_retry_interval = args.err_retry_interval;
    operation.fail_fast = args.fail_fast;
    operation.disable_crc64 = args.disable_crc64;
    operation.disable_checksum = args.disable_checksum;
    operation.snapshot_path = args.snapshot_path.clone();
    operation.delete = args.delete;
    operation.backup_dir = args
        .backup_dir
        .as_deref()
        .map(Location::parse)
        .transpose()?;
    operation.update = args.update;
    operation.move_source = args.move_source;
    operation.max_sync_entries = args.max_sync_entries;
    operation.storage_class = args.storage_class.clone();
    operation.acl = args.acl.clone();
    operation.grants = store::Grants {
        read: args.grant_read.clone(),
        read_acp: args.grant_read_acp.clone(),
        write_acp: args.grant_write_acp.clone(),
        full_control: args.grant_full_control.clone(),
    };
    operation.tags = args.tags.as_deref().map(operation::parse_tags).transpose()?;
    if let Some(meta) = &args.meta {
        operation.metadata = operation::parse_meta(meta)?;
    }
    operation.encryption = operation::parse_encryption(&EncryptionArgs {
        encryption_type: args.encryption_type.clone(),
        server_side_encryption: args.server_side_encryption.clone(),
        sse_customer_algo: args.sse_customer_algo.clone(),
        sse_customer_key: args.sse_customer_key.clone(),
        sse_customer_key_md5: args.sse_customer_key_md5.clone(),
    })?;
    operation.forbid_overwrite = args.forbid_overwrite;
    operation.fail_output = args
        .fail_output
        .then(|| operation::normalize(&args.fail_output_path));
    operation.process_log = args
        .process_log
        .then(|| operation::normalize(&args.process_log_path));
    operation.validate()?;
    Ok(operation)
}

/// Ask before a mirror run removes anything from the destination
fn confirm_delete(operation: &TransferOperation) -> anyhow::Result<bool> {
    use std::io::Write;
    eprint!(
        "sync --delete will remove entries of {} that do not exist in {}, continue? (y/n) ",
        operation.destination, operation.source
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read the confirmation")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

#[instrument(skip_all)]
async fn connect(args: &Args) -> anyhow::Result<store::s3::S3Store> {
    let path = args
        .config_path
        .clone()
        .or_else(store::session::Profile::default_path);
    let mut profile = store::session::Profile::load_or_default(path.as_deref())?;
    if let Some(endpoint) = &args.endpoint {
        profile.endpoint = Some(endpoint.clone());
    }
    let role = match profile.mode {
        store::session::AuthMode::Role => Some(store::session::role_credentials().await?),
        store::session::AuthMode::SecretKey => None,
    };
    let explicit = store::session::ExplicitCredentials {
        secret_id: args.secret_id.clone(),
        secret_key: args.secret_key.clone(),
        session_token: args.session_token.clone(),
    }
    .with_env();
    let credentials = store::session::resolve_credentials(&profile, role, &explicit)?;
    let policy = store::session::ClientPolicy::new(&store::session::PolicyInputs {
        routines: args.routines,
        long_links_nums: args.long_links_nums,
        disable_long_links: args.disable_long_links,
        retry_num: args.retry_num,
        err_retry_num: args.err_retry_num,
        err_retry_interval: args.err_retry_interval,
        close_auto_switch_host: args.close_auto_switch_host.or(profile.close_auto_switch_host),
        disable_checksum: args.disable_checksum,
    });
    Ok(policy.connect(&credentials, &profile))
}

#[instrument(skip_all, fields(source = %operation.source, destination = %operation.destination))]
async fn async_main(
    args: Args,
    operation: TransferOperation,
    monitor: Arc<common::progress::Monitor>,
) -> anyhow::Result<common::progress::Summary> {
    let store = connect(&args).await?;
    let stamp = run_stamp();
    let process_log = match &operation.process_log {
        Some(path) => LogSink::start(path, &stamp, PROCESS_LOG_FILE),
        None => LogSink::disabled(),
    };
    let fail_log = match &operation.fail_output {
        Some(path) => LogSink::start(path, &stamp, FAIL_REPORT_FILE),
        None => LogSink::disabled(),
    };
    let snapshot = match &operation.snapshot_path {
        Some(path) => Some(rxfer::snapshot::SnapshotStore::open(path).await?),
        None => None,
    };
    let throttle = operation
        .rate_limit
        .bytes_per_second()
        .map(|bps| Arc::new(throttle::Throttle::new(bps)));
    let mut ctx = PipelineContext::new(operation, Arc::new(store), monitor)
        .with_logs(process_log, fail_log);
    if let Some(snapshot) = snapshot {
        ctx = ctx.with_snapshot(snapshot);
    }
    if let Some(throttle) = throttle {
        ctx = ctx.with_throttle(throttle);
    }
    rxfer::run(Arc::new(ctx)).await
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version go to stdout and are not failures
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    let (command, args) = match cli.command {
        Commands::Cp(args) => (Command::Copy, args),
        Commands::Sync(args) => (Command::Sync, args),
    };
    let operation = match build_operation(command, &args) {
        Ok(operation) => operation,
        Err(error) => {
            eprintln!("rxfer {}: {:#}", command.name(), error);
            std::process::exit(ExitStatus::Aborted.code());
        }
    };
    if operation.delete && !args.force {
        match confirm_delete(&operation) {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("aborted, nothing was transferred or deleted");
                std::process::exit(ExitStatus::Aborted.code());
            }
            Err(error) => {
                eprintln!("{:#}", error);
                std::process::exit(ExitStatus::Aborted.code());
            }
        }
    }
    let monitor = Arc::new(common::progress::Monitor::new());
    let progress = (args.progress || args.progress_type.is_some() || args.progress_delay.is_some())
        .then(|| common::ProgressSettings {
            progress_type: args.progress_type.unwrap_or_default(),
            progress_delay: args.progress_delay.clone(),
            monitor: monitor.clone(),
        });
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
    };
    let func = move || async_main(args, operation, monitor);
    let res = common::run(progress, output, runtime, tracing, func);
    std::process::exit(ExitStatus::from_summary(res.as_ref()).code());
}
