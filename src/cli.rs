use crate::{
    actions::{ActionBatch, ActionType, BatchEvent, BatchStatus, BatchSummary, ItemState},
    app::{App, StartupOptions},
    cache::bytes_to_kibibytes,
    item::ItemId,
    logging::{self, CliVerbosity},
    reconcile::{ModView, Reconciliation, Roots},
    scanner::PresenceRecord,
    steam,
    transfer::TransferReport,
};
use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    verbosity: CliVerbosity,
    startup: StartupOptions,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Status,
    Sync { yes: bool },
    Copy(Vec<ItemId>),
    Delete { ids: Vec<ItemId>, yes: bool },
    CacheStats,
    CacheClear,
    CacheRefresh,
    PathsShow,
    PathsSet { steam: Option<PathBuf> },
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args)?;
    logging::init(global.verbosity);
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modsync v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let mut app = App::initialize(global.startup)?;
            let result = run_command(&mut app, command, global.format, global.verbosity);
            // Batches are joined inside run_command; the cache is saved
            // whatever the command's outcome.
            let saved = app.shutdown();
            result.and(saved)
        }
    }
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut verbosity = CliVerbosity::Normal;
    let mut startup = StartupOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = OutputFormat::parse(value)
                .ok_or_else(|| anyhow!("Unknown format: {value} (use 'text' or 'json')"))?;
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let value = iter.next().ok_or_else(|| anyhow!("--format requires a value"))?;
                format = OutputFormat::parse(value)
                    .ok_or_else(|| anyhow!("Unknown format: {value} (use 'text' or 'json')"))?;
            }
            "--source" => {
                let value = iter.next().ok_or_else(|| anyhow!("--source requires a path"))?;
                startup.source_root = Some(PathBuf::from(value));
            }
            "--target" => {
                let value = iter.next().ok_or_else(|| anyhow!("--target requires a path"))?;
                startup.target_root = Some(PathBuf::from(value));
            }
            "--config-dir" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--config-dir requires a path"))?;
                startup.config_dir = Some(PathBuf::from(value));
            }
            "-q" | "--quiet" => verbosity = CliVerbosity::Quiet,
            "--verbose" => verbosity = CliVerbosity::Verbose,
            _ if arg.starts_with("-v") && arg.chars().skip(1).all(|ch| ch == 'v') => {
                verbosity = if arg.len() >= 3 {
                    CliVerbosity::Debug
                } else {
                    CliVerbosity::Verbose
                };
            }
            _ => tokens.push(arg.to_string()),
        }
    }

    Ok((
        GlobalOptions {
            format,
            verbosity,
            startup,
        },
        tokens,
    ))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "--help" | "-h" | "help" => Ok(CliCommand::Help),
        "--version" | "-V" | "version" => Ok(CliCommand::Version),
        "status" => Ok(CliCommand::Status),
        "sync" => Ok(CliCommand::Sync {
            yes: has_yes(rest),
        }),
        "copy" => {
            let ids = parse_ids(rest)?;
            if ids.is_empty() {
                bail!("copy requires one or more item ids");
            }
            Ok(CliCommand::Copy(ids))
        }
        "delete" => {
            let ids = parse_ids(rest)?;
            if ids.is_empty() {
                bail!("delete requires one or more item ids");
            }
            Ok(CliCommand::Delete {
                ids,
                yes: has_yes(rest),
            })
        }
        "cache" => match rest.first().map(|value| value.as_str()).unwrap_or("stats") {
            "stats" => Ok(CliCommand::CacheStats),
            "clear" => Ok(CliCommand::CacheClear),
            "refresh" => Ok(CliCommand::CacheRefresh),
            sub => bail!("Unknown cache command: {sub} (use 'stats', 'clear', or 'refresh')"),
        },
        "paths" => match rest.first().map(|value| value.as_str()).unwrap_or("show") {
            "show" => Ok(CliCommand::PathsShow),
            "set" => {
                let mut steam = None;
                let mut iter = rest.iter().skip(1);
                while let Some(arg) = iter.next() {
                    match arg.as_str() {
                        "--steam" => {
                            let value =
                                iter.next().ok_or_else(|| anyhow!("--steam requires a path"))?;
                            steam = Some(PathBuf::from(value));
                        }
                        other => bail!("Unexpected argument for paths set: {other}"),
                    }
                }
                Ok(CliCommand::PathsSet { steam })
            }
            sub => bail!("Unknown paths command: {sub} (use 'show' or 'set')"),
        },
        other => bail!("Unknown command: {other} (see 'modsync help')"),
    }
}

fn has_yes(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "--yes" || arg == "-y")
}

fn parse_ids(args: &[String]) -> Result<Vec<ItemId>> {
    let mut ids = Vec::new();
    for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
        let id: ItemId = arg.parse().map_err(|err: String| anyhow!(err))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn run_command(
    app: &mut App,
    command: CliCommand,
    format: OutputFormat,
    verbosity: CliVerbosity,
) -> Result<()> {
    match command {
        CliCommand::Status => {
            app.require_roots()?;
            let view = app.reconciler.refresh();
            print_status(&view, format)
        }
        CliCommand::Sync { yes } => sync(app, yes, format, verbosity),
        CliCommand::Copy(ids) => run_batch(app, ActionType::Copy, &ids, format, verbosity),
        CliCommand::Delete { ids, yes } => {
            if app.config.confirm_delete && !yes {
                bail!(
                    "Refusing to delete {} item(s) without --yes (set confirm_delete to false to skip this)",
                    ids.len()
                );
            }
            run_batch(app, ActionType::Delete, &ids, format, verbosity)
        }
        CliCommand::CacheStats => print_cache_stats(app, format),
        CliCommand::CacheClear => {
            app.cache.clear();
            if format == OutputFormat::Text {
                println!("Metadata cache cleared");
            }
            print_cache_stats(app, format)
        }
        CliCommand::CacheRefresh => {
            app.require_roots()?;
            app.cache.forget_failures();
            let view = app.reconciler.refresh();
            let missing = view.views.iter().filter(|view| view.title.is_none()).count();
            if format == OutputFormat::Text {
                println!(
                    "Metadata known for {} item(s), {missing} unavailable",
                    view.views.len() - missing
                );
            }
            print_cache_stats(app, format)
        }
        CliCommand::PathsShow => print_paths(app, format),
        CliCommand::PathsSet { steam } => {
            let roots = match steam {
                Some(steam_root) => steam::roots_for(&steam_root),
                None => app.require_roots()?,
            };
            app.set_roots(roots)?;
            print_paths(app, format)
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct StatusItem {
    id: ItemId,
    title: Option<String>,
    state: &'static str,
    source_modified: Option<String>,
    target_modified: Option<String>,
}

impl StatusItem {
    fn from_view(view: &ModView) -> Self {
        Self {
            id: view.id,
            title: view.title.clone(),
            state: state_label(view),
            source_modified: view.source.as_ref().and_then(format_modified),
            target_modified: view.target.as_ref().and_then(format_modified),
        }
    }
}

fn state_label(view: &ModView) -> &'static str {
    match view.freshness {
        Some(freshness) => freshness.label(),
        None => "not in workshop",
    }
}

fn print_status(view: &Reconciliation, format: OutputFormat) -> Result<()> {
    let items: Vec<StatusItem> = view.views.iter().map(StatusItem::from_view).collect();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No mods found");
            }
            for (item, view) in items.iter().zip(&view.views) {
                println!(
                    "{state:<16} {id:>12} {title}",
                    state = item.state,
                    id = item.id,
                    title = view.display_title()
                );
            }
            let pending = view.pending().len();
            if pending > 0 {
                println!();
                println!("{pending} item(s) can be synced (modsync sync)");
            }
        }
    }
    Ok(())
}

fn format_modified(record: &PresenceRecord) -> Option<String> {
    let date = OffsetDateTime::from_unix_timestamp(record.last_modified.unix_seconds()).ok()?;
    date.format(&Rfc3339).ok()
}

#[derive(Serialize)]
struct SyncOutput {
    copied: Vec<PathBuf>,
    faults: Vec<SyncFault>,
}

#[derive(Serialize)]
struct SyncFault {
    source: PathBuf,
    target: PathBuf,
    error: String,
}

impl From<TransferReport> for SyncOutput {
    fn from(report: TransferReport) -> Self {
        Self {
            copied: report.completed,
            faults: report
                .faults
                .into_iter()
                .map(|(source, fault)| SyncFault {
                    source,
                    target: fault.target,
                    error: fault.message,
                })
                .collect(),
        }
    }
}

fn sync(app: &App, yes: bool, format: OutputFormat, verbosity: CliVerbosity) -> Result<()> {
    app.require_roots()?;
    let view = app.reconciler.refresh();
    let pending = view.pending();
    let replacing = pending
        .iter()
        .filter(|id| view.get(**id).is_some_and(|view| view.target.is_some()))
        .count();
    if replacing > 0 && app.config.confirm_delete && !yes {
        bail!("Sync would replace {replacing} installed item(s); rerun with --yes");
    }

    let jobs = view.copy_jobs(&pending);
    if format == OutputFormat::Text && verbosity != CliVerbosity::Quiet {
        println!("Syncing {} item(s)", jobs.len());
    }
    let mut printer = ProgressPrinter::new(verbosity, format);
    let report = app
        .transfers
        .transfer(jobs)
        .join_with_progress(|value| printer.update(value))?;
    printer.finish();

    let failed = report.faults.len();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&SyncOutput::from(report))?);
        }
        OutputFormat::Text => {
            for (source, fault) in &report.faults {
                eprintln!(
                    "Failed: {} -> {} ({})",
                    source.display(),
                    fault.target.display(),
                    summarize_error(&fault.message)
                );
            }
            if verbosity != CliVerbosity::Quiet {
                println!("Copied {} item(s)", report.completed.len());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} item(s) failed to sync");
    }
    Ok(())
}

fn run_batch(
    app: &App,
    action: ActionType,
    ids: &[ItemId],
    format: OutputFormat,
    verbosity: CliVerbosity,
) -> Result<()> {
    app.require_roots()?;
    let view = app.reconciler.refresh();
    let items = view.action_items(ids);
    let batch = ActionBatch::new(action, items);

    let mut printer = ProgressPrinter::new(verbosity, format);
    let summary = app.actions.submit(batch).join_with(|event| match event {
        BatchEvent::Item(outcome) => {
            if format == OutputFormat::Text {
                printer.clear_line();
                let title = view
                    .get(outcome.id)
                    .map(ModView::display_title)
                    .unwrap_or_else(|| outcome.id.to_string());
                match &outcome.state {
                    ItemState::Error(cause) => {
                        eprintln!("  {} {title}: {}", action.label(), summarize_error(cause))
                    }
                    state if verbosity != CliVerbosity::Quiet => {
                        println!("  {} {title}: {state}", action.label())
                    }
                    _ => {}
                }
            }
        }
        BatchEvent::Progress(value) => printer.update(*value),
        BatchEvent::Finished(_) => printer.finish(),
    })?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    batch_result(&summary)
}

fn batch_result(summary: &BatchSummary) -> Result<()> {
    if let BatchStatus::Aborted(reason) = &summary.status {
        bail!("{} batch aborted: {reason}", summary.action.label());
    }
    let failed = summary.failures().count();
    if failed > 0 {
        bail!("{failed} item(s) failed to {}", summary.action.label());
    }
    Ok(())
}

#[derive(Serialize)]
struct CacheStatsOutput {
    entries: usize,
    used_kib: u64,
    free_kib: u64,
    soft_cap_kib: u64,
    over_cap: bool,
}

fn print_cache_stats(app: &App, format: OutputFormat) -> Result<()> {
    app.save_cache()?;
    let stats = app.cache_stats();
    let output = CacheStatsOutput {
        entries: stats.entries,
        used_kib: stats.used_kib(),
        free_kib: stats.free_kib(),
        soft_cap_kib: bytes_to_kibibytes(stats.soft_cap_bytes),
        over_cap: stats.over_cap(),
    };
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Entries:   {}", output.entries);
            println!("Used:      {} KB", output.used_kib);
            println!("Free:      {} KB of {} KB", output.free_kib, output.soft_cap_kib);
            if output.over_cap {
                println!("Cache is over its soft cap; `modsync cache clear` resets it");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsOutput {
    config: PathBuf,
    cache: PathBuf,
    roots: Roots,
}

fn print_paths(app: &App, format: OutputFormat) -> Result<()> {
    let output = PathsOutput {
        config: app.config.config_path(),
        cache: app.config.cache_path(),
        roots: app.reconciler.roots(),
    };
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Config:   {}", output.config.display());
            println!("Cache:    {}", output.cache.display());
            println!("Workshop: {}", display_root(&output.roots.source));
            println!("Mods:     {}", display_root(&output.roots.target));
        }
    }
    Ok(())
}

fn display_root(path: &std::path::Path) -> String {
    if path.as_os_str().is_empty() {
        "(not set)".to_string()
    } else {
        path.display().to_string()
    }
}

struct ProgressPrinter {
    enabled: bool,
    last_tick: Option<Instant>,
    drawn: bool,
}

impl ProgressPrinter {
    fn new(verbosity: CliVerbosity, format: OutputFormat) -> Self {
        Self {
            enabled: format == OutputFormat::Text && verbosity != CliVerbosity::Quiet,
            last_tick: None,
            drawn: false,
        }
    }

    fn update(&mut self, value: f64) {
        if !self.enabled {
            return;
        }
        let due = self
            .last_tick
            .map_or(true, |tick| tick.elapsed() >= Duration::from_millis(250));
        if !due && value < 1.0 {
            return;
        }
        eprint!("\r  {:>3}%", (value * 100.0).round() as u32);
        self.drawn = true;
        self.last_tick = Some(Instant::now());
    }

    fn clear_line(&mut self) {
        if self.drawn {
            eprint!("\r      \r");
            self.drawn = false;
        }
    }

    fn finish(&mut self) {
        if self.drawn {
            eprintln!();
            self.drawn = false;
        }
    }
}

fn summarize_error(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or(error).trim();
    let last = first_line.rsplit(": ").next().unwrap_or(first_line).trim();
    let lower = last.to_lowercase();

    if lower.contains("device or resource busy") || lower.contains("text file busy") {
        return "file in use".to_string();
    }
    if lower.contains("permission denied") || lower.contains("access is denied") {
        return "permission denied".to_string();
    }
    if lower.contains("no such file or directory") || lower.contains("file not found") {
        return "file not found".to_string();
    }
    if lower.contains("is a directory") {
        return "expected a file".to_string();
    }
    if lower.contains("no space left") {
        return "disk full".to_string();
    }

    last.to_string()
}

fn print_help() {
    println!("modsync v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modsync status                  Compare workshop downloads with installed mods");
    println!("  modsync sync [--yes]            Copy every new or updated item");
    println!("  modsync copy <id>...            Copy the given items");
    println!("  modsync delete <id>... [--yes]  Remove the given items from the mod folder");
    println!("  modsync cache stats             Show metadata cache size");
    println!("  modsync cache clear             Drop all cached metadata");
    println!("  modsync cache refresh           Retry items whose metadata was unavailable");
    println!("  modsync paths [show]            Show config, cache, and mod folders");
    println!("  modsync paths set [--steam <dir>]  Store the current (or Steam-derived) folders");
    println!();
    println!("Global options:");
    println!("  --source <dir>                  Workshop content folder");
    println!("  --target <dir>                  Game mod folder");
    println!("  --config-dir <dir>              Config and cache location (or MODSYNC_HOME)");
    println!("  --format <json|text>            Output format");
    println!("  -q, --quiet                     Errors only");
    println!("  -v, -vv                         Increase verbosity (RUST_LOG overrides)");
    println!("  -h, --help                      Show help");
    println!("  -V, --version                   Show version");
}
