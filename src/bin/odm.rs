use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use opendata_mirror::aggregate::{AggregateResult, DatasetAggregate, StatusResult};
use opendata_mirror::app::{
    App, EngineSettings, FullSyncResult, ProgressSinkKind, RunOptions, Selection, SyncResult,
};
use opendata_mirror::config::{ConfigLoader, ResolvedConfig};
use opendata_mirror::ddf::{self, CommandDescriber};
use opendata_mirror::domain::ReportGrouping;
use opendata_mirror::error::MirrorError;
use opendata_mirror::http::HttpRemote;
use opendata_mirror::output::{JsonOutput, OutputMode};
use opendata_mirror::remote::RemoteRouter;
use opendata_mirror::store::Store;
use opendata_mirror::tui::Tui;
use opendata_mirror::xrootd::{XrootdClient, XrootdToolStatus};

#[derive(Parser)]
#[command(name = "odm")]
#[command(about = "Mirror CMS open-data manifests with a size-verified ledger")]
#[command(version, author)]
struct Cli {
    /// Configuration file (default: ./odm.json, then the user config dir)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Base directory holding datasets/, samples/, processed/ and reports/
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch manifest entries that are neither ledgered nor on disk")]
    Download(PassArgs),
    #[command(about = "Re-verify local sizes against the remote and rewrite ledgers")]
    Audit(PassArgs),
    #[command(about = "Write availability reports for complete datasets")]
    Report(ReportArgs),
    #[command(about = "Download, audit, then report")]
    Sync(SyncArgs),
    #[command(about = "Show manifest, ledger and local counts per dataset")]
    Status(SelectArgs),
    #[command(about = "Build a dataset definition file from a report")]
    Ddf(DdfArgs),
}

#[derive(Args, Clone)]
struct SelectArgs {
    /// Only manifests whose name contains this keyword (case-insensitive)
    #[arg(long)]
    keyword: Option<String>,
}

#[derive(Args, Clone)]
struct PassArgs {
    #[command(flatten)]
    select: SelectArgs,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct ReportArgs {
    #[command(flatten)]
    select: SelectArgs,

    #[arg(long)]
    grouping: Option<ReportGrouping>,
}

#[derive(Args, Clone)]
struct SyncArgs {
    #[command(flatten)]
    pass: PassArgs,

    #[arg(long)]
    grouping: Option<ReportGrouping>,
}

#[derive(Args, Clone)]
struct DdfArgs {
    /// Report file (`absolutePath,sizeMB` lines)
    report: Utf8PathBuf,

    #[arg(long, default_value = "ddf")]
    out: Utf8PathBuf,

    /// Program printing {"events", "weight_sum"} for a file path
    #[arg(long)]
    describe: Option<std::path::PathBuf>,
}

impl SelectArgs {
    fn selection(&self) -> Selection {
        match &self.keyword {
            Some(keyword) => Selection::keyword(keyword.clone()),
            None => Selection::all(),
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MirrorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::StorageRoot(_)
        | MirrorError::MissingConfig
        | MirrorError::ConfigRead(_)
        | MirrorError::ConfigParse(_) => 2,
        MirrorError::RemoteUnreachable { .. }
        | MirrorError::RemoteNotFound(_)
        | MirrorError::RemoteSizeUnparseable(_)
        | MirrorError::TransferFailed { .. }
        | MirrorError::UnsupportedRemote(_)
        | MirrorError::MissingTool(_)
        | MirrorError::DescribeFailed(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    if let Commands::Ddf(args) = &cli.command {
        let describe = match &args.describe {
            Some(program) => Some(program.clone()),
            None => ConfigLoader::resolve(cli.config.as_deref(), cli.root.as_deref())
                .ok()
                .and_then(|resolved| resolved.tools.describe),
        };
        return run_ddf(args.clone(), describe, output_mode);
    }

    let resolved = ConfigLoader::resolve(cli.config.as_deref(), cli.root.as_deref())?;
    let app = build_app(&resolved)?;

    match cli.command {
        Commands::Download(args) => {
            run_pass(app, ProgressSinkKind::Download, args, output_mode)
        }
        Commands::Audit(args) => run_pass(app, ProgressSinkKind::Audit, args, output_mode),
        Commands::Report(args) => run_report(app, args, output_mode),
        Commands::Sync(args) => run_sync(app, args, output_mode),
        Commands::Status(args) => run_status(app, args, output_mode),
        Commands::Ddf(_) => Ok(()),
    }
}

fn build_app(resolved: &ResolvedConfig) -> miette::Result<App<RemoteRouter, RemoteRouter>> {
    let xrootd = XrootdClient::with_tools(resolved.tools.xrdfs.clone(), resolved.tools.xrdcp.clone());
    if let XrootdToolStatus::Missing { message } = xrootd.tool_status() {
        tracing::warn!("{message}; root:// entries will fail");
    }
    let http = HttpRemote::new(resolved.http_timeout_secs)?;
    let router = RemoteRouter::new(xrootd, http);
    Ok(App::new(
        Store::new(resolved.roots.clone()),
        router.clone(),
        router,
        EngineSettings::from(resolved),
    ))
}

fn run_pass(
    app: App<RemoteRouter, RemoteRouter>,
    kind: ProgressSinkKind,
    args: PassArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let selection = args.select.selection();
    let options = RunOptions {
        dry_run: args.dry_run,
    };
    let audit = matches!(kind, ProgressSinkKind::Audit);
    match output_mode {
        OutputMode::NonInteractive => {
            let result = if audit {
                app.audit(&selection, options, &JsonOutput)?
            } else {
                app.download(&selection, options, &JsonOutput)?
            };
            JsonOutput::print_sync(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(kind);
            let result = tui.run(move |sink| {
                if audit {
                    app.audit(&selection, options, sink)
                } else {
                    app.download(&selection, options, sink)
                }
            })?;
            tui.finish(pass_summary(&result))?;
            Ok(())
        }
    }
}

fn run_report(
    app: App<RemoteRouter, RemoteRouter>,
    args: ReportArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let selection = args.select.selection();
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.report(&selection, args.grouping, &JsonOutput)?;
            JsonOutput::print_report(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Report);
            let grouping = args.grouping;
            let result = tui.run(move |sink| app.report(&selection, grouping, sink))?;
            tui.finish(report_summary(&result))?;
            Ok(())
        }
    }
}

fn run_sync(
    app: App<RemoteRouter, RemoteRouter>,
    args: SyncArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let selection = args.pass.select.selection();
    let options = RunOptions {
        dry_run: args.pass.dry_run,
    };
    let grouping = args.grouping;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.sync(&selection, options, grouping, &JsonOutput)?;
            JsonOutput::print_full_sync(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Sync);
            let result = tui.run(move |sink| app.sync(&selection, options, grouping, sink))?;
            tui.finish(sync_summary(&result))?;
            Ok(())
        }
    }
}

fn run_status(
    app: App<RemoteRouter, RemoteRouter>,
    args: SelectArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let selection = args.selection();
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.status(&selection, &JsonOutput)?;
            JsonOutput::print_status(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Status);
            let result = tui.run(move |sink| app.status(&selection, sink))?;
            tui.finish(status_summary(&result))?;
            Ok(())
        }
    }
}

fn run_ddf(
    args: DdfArgs,
    describe: Option<std::path::PathBuf>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let program = describe.ok_or_else(|| {
        MirrorError::MissingTool("describe (set tools.describe or pass --describe)".to_string())
    })?;
    let describer = CommandDescriber::new(program);
    match output_mode {
        OutputMode::NonInteractive => {
            let definition = ddf::build_definition(&args.report, &describer, &JsonOutput)?;
            let path = ddf::write_definition(&args.out, &definition)?;
            JsonOutput::print_ddf(path.as_str(), &definition).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Ddf);
            let (path, files) = tui.run(move |sink| {
                let definition = ddf::build_definition(&args.report, &describer, sink)?;
                let path = ddf::write_definition(&args.out, &definition)?;
                Ok((path, definition.files.len()))
            })?;
            tui.finish(vec![format!("wrote {path} ({files} files)")])?;
            Ok(())
        }
    }
}

fn pass_summary(result: &SyncResult) -> Vec<String> {
    let totals = &result.totals;
    let mut lines = vec![format!(
        "{} {} datasets{}",
        result.mode,
        result.datasets.len(),
        if result.dry_run { " (dry run)" } else { "" }
    )];
    lines.push(format!(
        "ledger hits {}  on disk {}  fetched {}  would fetch {}  failed {}",
        totals.ledger_hits,
        totals.local_present,
        totals.fetched,
        totals.would_fetch,
        totals.fetch_failed + totals.ledger_failed
    ));
    lines.push(format!(
        "verified {}  mismatched {}  unverifiable {}  absent {}",
        totals.size_match, totals.size_mismatch, totals.unverifiable, totals.local_absent
    ));
    for failure in &result.failures {
        lines.push(format!("skipped {}: {}", failure.manifest, failure.error));
    }
    lines
}

fn report_summary(result: &AggregateResult) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in &result.datasets {
        match entry {
            DatasetAggregate::Complete {
                dataset,
                report,
                lines: count,
            } => lines.push(format!("{dataset}: {count} lines -> {report}")),
            DatasetAggregate::Discrepancy { notice, .. } => lines.push(notice.clone()),
            DatasetAggregate::Empty { dataset } => {
                lines.push(format!("{dataset}: empty manifest, no report"))
            }
            DatasetAggregate::Failed { manifest, reason } => {
                lines.push(format!("{manifest}: {reason}"))
            }
        }
    }
    if lines.is_empty() {
        lines.push("no datasets selected".to_string());
    }
    lines
}

fn sync_summary(result: &FullSyncResult) -> Vec<String> {
    let mut lines = pass_summary(&result.download);
    lines.extend(pass_summary(&result.audit));
    if result.report.skipped {
        lines.push("report skipped (dry run)".to_string());
    } else {
        lines.extend(report_summary(&result.report));
    }
    lines
}

fn status_summary(result: &StatusResult) -> Vec<String> {
    let mut lines = result
        .datasets
        .iter()
        .map(|status| {
            format!(
                "{} manifest={} ledger={} local={} {}",
                status.dataset,
                status.manifest_entries,
                status.ledger_entries,
                status.local_present,
                if status.complete { "complete" } else { "incomplete" }
            )
        })
        .collect::<Vec<_>>();
    for failure in &result.failures {
        lines.push(format!("skipped {}: {}", failure.manifest, failure.error));
    }
    lines
}
