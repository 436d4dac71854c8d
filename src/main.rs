mod check;
mod cli;
mod config;
mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use check::archive::TarGzArchiver;
use check::output;
use check::provider::{DockerProvider, HostProvider};
use check::redact::PatternRedactor;
use check::report::{build_report, report_id, Deps};
use check::runner::{NoProgress, Orchestrator, Progress, RunOptions, StderrProgress};
use check::store::ArtifactStore;
use cli::{Cli, Commands};
use config::Config;
use utils::format::parse_duration;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// 日志写 stderr；RUST_LOG 优先于 --debug
fn init_tracing(debug: bool) {
    let default = if debug { "sediag=debug" } else { "sediag=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Report { container, since, output, verbose, data_dir, config, etcd_perf } => {
            let config = load_config(config.as_deref(), etcd_perf)?;
            let request = ReportRequest { container, since, output, verbose, data_dir, quiet: cli.quiet };
            run_report(request, &config)
        }
        Commands::List { config, etcd_perf } => {
            let config = load_config(config.as_deref(), etcd_perf)?;
            list_checks(&config)
        }
    }
}

struct ReportRequest {
    container: Option<String>,
    since: String,
    output: String,
    verbose: bool,
    data_dir: PathBuf,
    quiet: bool,
}

fn load_config(path: Option<&Path>, etcd_perf: bool) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    if etcd_perf {
        config.etcd_perf.enabled = true;
    }
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn deps(config: &Config) -> anyhow::Result<Deps> {
    let redactor = PatternRedactor::new(&config.redact.extra_patterns)?;
    Ok(Deps {
        host: Arc::new(HostProvider),
        container: Arc::new(DockerProvider::new()),
        redactor: Arc::new(redactor),
    })
}

fn run_report(req: ReportRequest, config: &Config) -> anyhow::Result<()> {
    if !matches!(req.output.as_str(), "text" | "json") {
        bail!("unknown output format: {}", req.output);
    }
    let time_window = parse_duration(&req.since)?;

    std::fs::create_dir_all(&req.data_dir)
        .with_context(|| format!("cannot create {}", req.data_dir.display()))?;

    let id = report_id(&hostname(), chrono::Local::now());
    let report = build_report(id.clone(), &deps(config)?, config);
    let store = ArtifactStore::create(req.data_dir.join(&id))?;
    let archiver = TarGzArchiver::new(&req.data_dir);

    let mut progress: Box<dyn Progress> = if req.quiet {
        Box::new(NoProgress)
    } else {
        Box::new(StderrProgress::default())
    };

    info!(
        report = %id,
        checks = report.check_count(),
        raw = %store.root().display(),
        "starting report"
    );
    let result = Orchestrator::new(&archiver, progress.as_mut()).run(
        &report,
        &store,
        RunOptions {
            target: req.container,
            time_window: Some(time_window),
            verbose_errors: req.verbose,
        },
    );

    output::display(&result, &req.output)?;

    let bundle = archiver.bundle_path(&id);
    if bundle.exists() && !req.quiet {
        eprintln!("Bundle: {}", bundle.display());
    }
    Ok(())
}

fn list_checks(config: &Config) -> anyhow::Result<()> {
    let report = build_report(String::new(), &deps(config)?, config);
    for section in &report.sections {
        println!("{}", section.title);
        for check in &section.checks {
            println!("  {}", check.describe());
        }
    }
    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
