use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use dove_core::data::{Database, Inventory};
use dove_core::model::ScanScope;
use dove_core::report::{
    ReportFormat, generate_inventory_json, generate_inventory_report, generate_scan_report,
    generate_scan_report_json, render_subscription, save_report,
};
use dove_core::scan::{ScanOptions, execute_scan};
use dove_scanner::ProbeOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

pub const DATABASE_FILE: &str = "dove.db";
const DEFAULT_LOG_FILTER: &str = "dove=info,dove_core=info,dove_scanner=info";
const VERBOSE_LOG_FILTER: &str = "dove=debug,dove_core=debug,dove_scanner=debug";

/// `RUST_LOG` wins when set; otherwise info, or debug with `--verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Tilde-expanded data directory and the database inside it.
pub fn resolve_db_path(data_dir: &str) -> PathBuf {
    let expanded = shellexpand::tilde(data_dir);
    Path::new(expanded.as_ref()).join(DATABASE_FILE)
}

/// The global `--data-dir`, falling back to the default location.
pub fn data_dir_arg(args: &ArgMatches) -> &str {
    args.get_one::<String>("data-dir")
        .map(String::as_str)
        .unwrap_or(crate::commands::DEFAULT_DATA_DIR)
}

/// Where `init` creates the database: its own `PATH` when given, otherwise
/// the global `--data-dir`.
pub fn init_db_path(args: &ArgMatches) -> PathBuf {
    let data_dir = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or_else(|| data_dir_arg(args));
    resolve_db_path(data_dir)
}

fn open_database(args: &ArgMatches) -> Result<Database> {
    let db_path = resolve_db_path(data_dir_arg(args));
    if !Database::exists(&db_path) {
        bail!(
            "no database at {} (run `dove init` first)",
            db_path.display()
        );
    }
    debug!("Opening database at {}", db_path.display());
    Database::new(&db_path).with_context(|| format!("failed to open {}", db_path.display()))
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

// ============================================================================
// init
// ============================================================================

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  DOVE INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let force = args.get_flag("force");
    let db_path = init_db_path(args);
    let config_dir = db_path
        .parent()
        .context("invalid database path")?
        .to_path_buf();

    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );

    if Database::exists(&db_path) {
        if !force {
            println!(
                "{} Database already exists at {} (use --force to recreate it)",
                "⚠".yellow().bold(),
                db_path.display()
            );
            return Ok(());
        }
        Database::drop(&db_path)
            .with_context(|| format!("failed to delete {}", db_path.display()))?;
        println!("{} Deleted existing database", "✓".green().bold());
    }

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    Database::new(&db_path).with_context(|| format!("failed to create {}", db_path.display()))?;

    println!("{} Dove initialization complete!", "✓".green().bold());
    println!("{} Database: {}", "✓".green().bold(), db_path.display());
    Ok(())
}

// ============================================================================
// mirrors and channels
// ============================================================================

pub fn handle_mirror_add(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let name = args.get_one::<String>("NAME").context("missing mirror name")?;
    let url = args.get_one::<Url>("URL").context("missing mirror URL")?;

    db.add_mirror(name, url.as_str())
        .with_context(|| format!("failed to add mirror {}", name))?;
    println!("{} Added mirror {} → {}", "✓".green().bold(), name.bright_white(), url);
    Ok(())
}

pub fn handle_mirror_remove(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let name = args.get_one::<String>("NAME").context("missing mirror name")?;

    if db.remove_mirror(name)? {
        println!("{} Removed mirror {}", "✓".green().bold(), name.bright_white());
    } else {
        println!("{} No mirror named {}", "⚠".yellow().bold(), name);
    }
    Ok(())
}

pub fn handle_mirror_list(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let mirrors = db.list_mirrors()?;
    if mirrors.is_empty() {
        println!("No mirrors configured. Add one with `dove mirror add <NAME> <URL>`.");
        return Ok(());
    }
    for mirror in mirrors {
        let state = if mirror.active {
            "active".green()
        } else {
            "inactive".dimmed()
        };
        println!(
            "  {} {} {} ({})",
            "•".blue(),
            mirror.name.bright_white(),
            mirror.url,
            state
        );
    }
    Ok(())
}

pub fn handle_channel_add(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let username = args
        .get_one::<String>("USERNAME")
        .context("missing channel username")?;

    db.add_channel(username)
        .with_context(|| format!("failed to add channel {}", username))?;
    println!("{} Added channel {}", "✓".green().bold(), username.bright_white());
    Ok(())
}

pub fn handle_channel_remove(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let username = args
        .get_one::<String>("USERNAME")
        .context("missing channel username")?;

    if db.remove_channel(username)? {
        println!("{} Removed channel {}", "✓".green().bold(), username.bright_white());
    } else {
        println!("{} No channel named {}", "⚠".yellow().bold(), username);
    }
    Ok(())
}

pub fn handle_channel_list(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let channels = db.list_channels()?;
    if channels.is_empty() {
        println!("No channels configured. Add one with `dove channel add <USERNAME>`.");
        return Ok(());
    }
    for channel in channels {
        let state = if channel.active {
            "active".green()
        } else {
            "inactive".dimmed()
        };
        println!("  {} {} ({})", "•".blue(), channel.username.bright_white(), state);
    }
    Ok(())
}

// ============================================================================
// scan
// ============================================================================

pub fn probe_options_from_args(args: &ArgMatches) -> ProbeOptions {
    let defaults = ProbeOptions::default();
    let secs = |name: &str, fallback: Duration| {
        args.get_one::<u64>(name)
            .map(|s| Duration::from_secs(*s))
            .unwrap_or(fallback)
    };

    ProbeOptions {
        tcp_timeout: secs("tcp-timeout", defaults.tcp_timeout),
        max_latency_ms: args
            .get_one::<u64>("max-latency")
            .copied()
            .unwrap_or(defaults.max_latency_ms),
        engine_path: args
            .get_one::<String>("engine")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.engine_path.clone()),
        transfer_tool: args
            .get_one::<String>("transfer-tool")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.transfer_tool.clone()),
        payload_url: args
            .get_one::<Url>("payload-url")
            .map(|u| u.to_string())
            .unwrap_or_else(|| defaults.payload_url.clone()),
        payload_kb: args
            .get_one::<f64>("payload-kb")
            .copied()
            .unwrap_or(defaults.payload_kb),
        startup_timeout: secs("startup-timeout", defaults.startup_timeout),
        transfer_timeout: secs("transfer-timeout", defaults.transfer_timeout),
        ..defaults
    }
}

pub fn scan_options_from_args(args: &ArgMatches, quiet: bool) -> Result<ScanOptions> {
    let source = args
        .get_one::<String>("source")
        .map(String::as_str)
        .unwrap_or("all");
    let scope = ScanScope::parse(source).with_context(|| format!("unknown source '{}'", source))?;

    Ok(ScanOptions {
        scope,
        links_file: args.get_one::<PathBuf>("links-file").cloned(),
        threads: args.get_one::<usize>("threads").copied().unwrap_or(4).max(1),
        probe: probe_options_from_args(args),
        show_progress_bars: !quiet,
        ..ScanOptions::default()
    })
}

pub async fn handle_scan(args: &ArgMatches, quiet: bool) -> Result<()> {
    let db = open_database(args)?;
    let options = scan_options_from_args(args, quiet)?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::parse(f))
        .unwrap_or(ReportFormat::Text);

    if let Some(path) = &options.links_file
        && !path.exists()
    {
        bail!("links file {} does not exist", path.display());
    }

    if !quiet {
        println!(
            "\n🕊️  Scanning {} sources with {} probe workers",
            options.scope.as_str(),
            options.threads
        );
        println!("Engine: {}", options.probe.engine_path.display());
        println!("Payload: {}\n", options.probe.payload_url);
    }

    let summary = execute_scan(&db, options).await.context("scan failed")?;

    let report = match format {
        ReportFormat::Text => generate_scan_report(&summary),
        ReportFormat::Json => generate_scan_report_json(&summary)?,
    };
    match args.get_one::<PathBuf>("output") {
        Some(path) => {
            save_report(&report, path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{} Report saved to {}", "✓".green().bold(), path.display());
        }
        None => print!("{}", report),
    }
    Ok(())
}

// ============================================================================
// feed and nodes
// ============================================================================

/// Write the subscription feed; returns how many links it holds.
pub fn write_feed(db: &Database, output: Option<&Path>) -> Result<usize> {
    let links = db.working_links()?;
    let feed = render_subscription(&links);
    match output {
        Some(path) => save_report(&feed, path)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(feed.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(links.len())
}

pub fn handle_feed(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let output = args.get_one::<PathBuf>("output");
    let count = write_feed(&db, output.map(PathBuf::as_path))?;
    if let Some(path) = output {
        eprintln!(
            "{} Wrote {} links to {}",
            "✓".green().bold(),
            count,
            path.display()
        );
    }
    Ok(())
}

pub fn handle_nodes(args: &ArgMatches) -> Result<()> {
    let db = open_database(args)?;
    let records = db.list_inventory()?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::parse(f))
        .unwrap_or(ReportFormat::Text);

    match format {
        ReportFormat::Text => print!("{}", generate_inventory_report(&records)),
        ReportFormat::Json => println!("{}", generate_inventory_json(&records)?),
    }
    Ok(())
}
