use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing_subscriber::EnvFilter;

use aptup::apt::{self, AptCache};
use aptup::cache::MemoryCache;
use aptup::config::Config;
use aptup::core::{Coordinator, Observer};
use aptup::error::{CoordinatorError, OperationFailure};
use aptup::progress::ProgressLog;
use aptup::types::{Activity, CheckState, PackageRecord, SelectionView};

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Default)]
struct Args {
    config: Option<PathBuf>,
    simulate: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or_else(|| eyre!("Usage: --config <path>"))?;
                args.config = Some(PathBuf::from(path));
            }
            "--simulate" => {
                let path = iter
                    .next()
                    .ok_or_else(|| eyre!("Usage: --simulate <fixture.json>"))?;
                args.simulate = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: aptup [--config <path>] [--simulate <fixture.json>]");
                std::process::exit(0);
            }
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn init_logging(config: &Config) {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    let Some(log_path) = &config.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(io::stderr)
            .init();
        return;
    };

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            drop(LOG_GUARD.set(guard));
            tracing::info!(path = %log_path.display(), "logging initialized");
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(io::stderr)
                .init();
            tracing::warn!(error = %e, "failed to open log file; using stderr");
        }
    }
}

/// Prints coordinator notifications as plain lines
struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn packages_changed(&mut self, packages: &[PackageRecord]) {
        println!("{} upgradable package(s). Type 'list' to see them.", packages.len());
    }

    fn activity_changed(&mut self, activity: Activity) {
        if activity.is_busy() {
            println!("{activity}...");
        }
    }

    fn selection_changed(&mut self, view: &SelectionView) {
        if !view.demoted.is_empty() {
            println!("Dropped by conflicts: {}", view.demoted.join(", "));
        }
    }

    fn operation_failed(&mut self, failure: &OperationFailure) {
        eprintln!("{failure}");
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = parse_args()?;
    let config = Config::load(args.config.as_deref())?;
    init_logging(&config);
    tracing::info!(simulate = args.simulate.is_some(), "aptup starting");

    let log = ProgressLog::new(config.log_capacity);
    let observer = Box::new(ConsoleObserver);
    let mut coordinator = match args.simulate {
        Some(fixture) => {
            Coordinator::spawn(move || MemoryCache::from_fixture(&fixture), log, observer)?
        }
        None => {
            if !apt::is_root() {
                println!("Not running as root: installing will fail.");
            }
            let pulse = config.pulse_interval();
            let update = config.update_metadata;
            Coordinator::spawn(move || AptCache::open(pulse, update), log, observer)?
        }
    };

    report(coordinator.refresh().map(|_id| ()));
    wait_idle(&mut coordinator, &config);
    run_shell(&mut coordinator, &config)?;

    coordinator.shutdown();
    tracing::info!("aptup exited");
    Ok(())
}

fn run_shell(coordinator: &mut Coordinator, config: &Config) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next().transpose()? else {
            return Ok(());
        };

        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or("");
        let arg = words.next();

        match (cmd, arg) {
            ("", _) => {}
            ("quit" | "q" | "exit", _) => return Ok(()),
            ("list" | "ls", _) => cmd_list(coordinator),
            ("show", Some(name)) => cmd_show(coordinator, name),
            ("select", Some(name)) => report(coordinator.apply_toggle(name, true).map(print_changes)),
            ("unselect", Some(name)) => {
                report(coordinator.apply_toggle(name, false).map(print_changes));
            }
            ("all", _) => report(coordinator.select_all().map(print_changes)),
            ("clear", _) => report(coordinator.clear_selection().map(print_changes)),
            ("apply", _) => report(coordinator.commit().map(|_id| ())),
            ("refresh", _) => report(coordinator.refresh().map(|_id| ())),
            ("show" | "select" | "unselect", None) => println!("Usage: {cmd} <package>"),
            _ => print_help(),
        }
        wait_idle(coordinator, config);
    }
}

/// Block the shell while an operation runs, streaming its progress
fn wait_idle(coordinator: &mut Coordinator, config: &Config) {
    loop {
        coordinator.poll_timeout(config.poll_interval());
        for line in coordinator.drain_log() {
            println!("  {line}");
        }
        if !coordinator.is_busy() {
            return;
        }
    }
}

fn report(result: Result<(), CoordinatorError>) {
    if let Err(e) = result {
        eprintln!("{e}");
    }
}

fn print_changes(view: &SelectionView) {
    if view.is_empty() {
        println!("Nothing selected.");
        return;
    }
    let deps: Vec<&str> = view.dependencies().collect();
    println!(
        "{} package(s) will be upgraded ({} pulled in as dependencies{}{})",
        view.change_set.len(),
        deps.len(),
        if deps.is_empty() { "" } else { ": " },
        deps.join(", ")
    );
}

fn cmd_list(coordinator: &Coordinator) {
    let packages = coordinator.packages();
    if packages.is_empty() {
        println!("No upgradable packages.");
        return;
    }
    let width = packages.iter().map(|p| p.name.len()).max().unwrap_or(0);
    for pkg in packages {
        let state = coordinator.selection().state_of(&pkg.name);
        println!(
            "{} {:width$}  {} -> {}  {:>10}  {}",
            state.symbol(),
            pkg.name,
            pkg.installed_str(),
            pkg.candidate_str(),
            pkg.download_size_str(),
            state.label(),
        );
    }
}

fn cmd_show(coordinator: &Coordinator, name: &str) {
    let Some(pkg) = coordinator.describe(name) else {
        println!("Unknown package: {name}");
        return;
    };
    let state = coordinator.selection().state_of(name);
    println!("Package:   {}", pkg.name);
    println!("Installed: {}", pkg.installed_str());
    println!("Candidate: {}", pkg.candidate_str());
    println!("Download:  {}", pkg.download_size_str());
    println!(
        "Selected:  {}",
        match state {
            CheckState::Unselected => "no",
            CheckState::Selected => "yes",
            CheckState::Dependency => "yes (dependency)",
        }
    );
    if !pkg.description.is_empty() {
        println!();
        println!("{}", pkg.description);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  list               Show upgradable packages");
    println!("  show <name>        Show package details");
    println!("  select <name>      Mark a package for upgrade");
    println!("  unselect <name>    Unmark a package");
    println!("  all                Mark every upgradable package");
    println!("  clear              Unmark everything");
    println!("  apply              Download and install the marked packages");
    println!("  refresh            Reload package lists");
    println!("  quit               Exit");
}
