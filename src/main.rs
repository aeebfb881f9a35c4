//! `romsorter` — ROM identification, planning and sorting engine.
//!
//! `sort_roms.rs`/`import_dats.rs` each get their own file; these
//! subcommands are thin CLI shells around `scanner`/`planner`/`executor`,
//! so they live inline here instead.

mod cancel;
mod config;
mod dat_index;
mod dat_parser;
mod error;
mod executor;
mod hasher;
mod heuristics;
mod index_lock;
mod override_rules;
mod path_safety;
mod planner;
mod platform_catalog;
mod resume;
mod scanner;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use log::{error, info};

use cancel::CancelToken;
use config::Config;
use error::Result;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("romsorter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Identify, plan and sort ROM collections against DAT catalogs")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to romsorter.toml")
                .action(ArgAction::Set),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("import-dats")
                .about("Ingest DAT files into the content-addressed index")
                .arg(Arg::new("DATS").required(true).num_args(1..).action(ArgAction::Set))
                .arg(Arg::new("platform").long("platform").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("scan")
                .about("Identify every file under a directory")
                .arg(Arg::new("ROOT").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("plan")
                .about("Compute and print a sort plan without applying it")
                .arg(Arg::new("ROOT").required(true).action(ArgAction::Set))
                .arg(Arg::new("DEST").required(true).action(ArgAction::Set))
                .arg(Arg::new("move").long("move").action(ArgAction::SetTrue)),
        )
        .subcommand(
            Command::new("sort")
                .about("Plan and apply a sort of a scanned directory")
                .arg(Arg::new("ROOT").required(true).action(ArgAction::Set))
                .arg(Arg::new("DEST").required(true).action(ArgAction::Set))
                .arg(Arg::new("move").long("move").action(ArgAction::SetTrue))
                .arg(Arg::new("dry-run").long("dry-run").action(ArgAction::SetTrue))
                .arg(
                    Arg::new("resume-file")
                        .long("resume-file")
                        .help("Checkpoint file tracking already-completed inputs")
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("rebuild")
                .about("Rebuild a collection against the DAT index, copy-only")
                .arg(Arg::new("ROOT").required(true).action(ArgAction::Set))
                .arg(Arg::new("DEST").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("resume")
                .about("Resume a previously interrupted sort from its checkpoint file")
                .arg(Arg::new("ROOT").required(true).action(ArgAction::Set))
                .arg(Arg::new("DEST").required(true).action(ArgAction::Set))
                .arg(Arg::new("move").long("move").action(ArgAction::SetTrue))
                .arg(Arg::new("resume-file").long("resume-file").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("catalog")
                .about("Platform catalog maintenance")
                .subcommand_required(true)
                .subcommand(
                    Command::new("validate")
                        .about("Load and validate a platform catalog")
                        .arg(
                            Arg::new("path")
                                .long("path")
                                .help("Catalog file to validate; defaults to the configured/bundled catalog")
                                .action(ArgAction::Set),
                        ),
                ),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let config = match config::load_config(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let result = match matches.subcommand() {
        Some(("import-dats", sub)) => run_import_dats(sub, &config).await,
        Some(("scan", sub)) => run_scan(sub, &config).await,
        Some(("plan", sub)) => run_plan(sub, &config).await,
        Some(("sort", sub)) => run_sort(sub, &config, false).await,
        Some(("rebuild", sub)) => run_sort(sub, &config, true).await,
        Some(("resume", sub)) => run_resume(sub, &config).await,
        Some(("catalog", sub)) => run_catalog(sub, &config).await,
        _ => unreachable!("clap enforces subcommand_required"),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_import_dats(sub: &clap::ArgMatches, config: &Config) -> Result<()> {
    let platform_id = sub.get_one::<String>("platform").expect("required").clone();
    let dat_paths: Vec<PathBuf> = sub
        .get_many::<String>("DATS")
        .expect("required")
        .map(PathBuf::from)
        .collect();

    let index = dat_index::DatIndex::open_for_ingest(
        &config.dats.index_path,
        &config.dats.lock_path,
        &config.dats.sharding,
    )
    .await?;

    for path in dat_paths {
        let parsed_list = dat_parser::parse_dat_file(&path)?;
        for parsed in parsed_list {
            let outcome = index.ingest(&path, &platform_id, &parsed).await?;
            match outcome {
                dat_index::IngestOutcome::Ingested { dat_id } => {
                    info!("ingested {} as dat_id {dat_id}", path.display());
                }
                dat_index::IngestOutcome::Unchanged { dat_id } => {
                    info!("{} unchanged (dat_id {dat_id})", path.display());
                }
            }
        }
    }
    Ok(())
}

async fn run_scan(sub: &clap::ArgMatches, config: &Config) -> Result<()> {
    let root = PathBuf::from(sub.get_one::<String>("ROOT").expect("required"));
    let scan_result = build_scan_result(&root, config).await?;

    info!(
        "scanned {} files, {} identified, {} errors",
        scan_result.items.len(),
        scan_result
            .items
            .iter()
            .filter(|i| i.identification.platform_id.is_some())
            .count(),
        scan_result.errors.len()
    );
    Ok(())
}

async fn run_plan(sub: &clap::ArgMatches, config: &Config) -> Result<()> {
    let root = PathBuf::from(sub.get_one::<String>("ROOT").expect("required"));
    let dest = PathBuf::from(sub.get_one::<String>("DEST").expect("required"));
    let scan_result = build_scan_result(&root, config).await?;

    let mode = if sub.get_flag("move") { planner::SortMode::Move } else { planner::SortMode::Copy };
    let plan = planner::plan_sort(&scan_result, config, &dest, mode)?;
    for action in &plan.actions {
        info!("{:?} -> {:?} [{:?}]", action.input_path, action.output_path, action.status);
    }
    Ok(())
}

async fn run_sort(sub: &clap::ArgMatches, config: &Config, rebuild: bool) -> Result<()> {
    let root = PathBuf::from(sub.get_one::<String>("ROOT").expect("required"));
    let dest = PathBuf::from(sub.get_one::<String>("DEST").expect("required"));
    let scan_result = build_scan_result(&root, config).await?;

    let plan = if rebuild {
        planner::plan_rebuild(&scan_result, config, &dest)?
    } else {
        let mode = if sub.get_flag("move") {
            planner::SortMode::Move
        } else {
            planner::SortMode::Copy
        };
        planner::plan_sort(&scan_result, config, &dest, mode)?
    };

    let dry_run = !rebuild && sub.get_flag("dry-run");
    let resume_path = sub.get_one::<String>("resume-file").map(PathBuf::from);

    let cancel = CancelToken::new();
    let report =
        executor::execute_sort(&plan, &cancel, &config.features.backup, resume_path.as_deref(), dry_run).await?;
    info!(
        "completed {}, skipped {}, errors {}{}",
        report.completed.len(),
        report.skipped.len(),
        report.errors.len(),
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

async fn run_resume(sub: &clap::ArgMatches, config: &Config) -> Result<()> {
    let root = PathBuf::from(sub.get_one::<String>("ROOT").expect("required"));
    let dest = PathBuf::from(sub.get_one::<String>("DEST").expect("required"));
    let resume_path = PathBuf::from(sub.get_one::<String>("resume-file").expect("required"));

    let scan_result = build_scan_result(&root, config).await?;
    let mode = if sub.get_flag("move") { planner::SortMode::Move } else { planner::SortMode::Copy };
    let plan = planner::plan_sort(&scan_result, config, &dest, mode)?;

    let cancel = CancelToken::new();
    let report =
        executor::execute_sort(&plan, &cancel, &config.features.backup, Some(&resume_path), false).await?;
    info!(
        "resumed: completed {}, skipped {}, errors {}",
        report.completed.len(),
        report.skipped.len(),
        report.errors.len()
    );
    Ok(())
}

async fn run_catalog(sub: &clap::ArgMatches, config: &Config) -> Result<()> {
    match sub.subcommand() {
        Some(("validate", validate_sub)) => {
            let path = validate_sub
                .get_one::<String>("path")
                .map(PathBuf::from)
                .or_else(|| config.scanner.platform_catalog_path.clone());
            let catalog = platform_catalog::load_catalog(path.as_deref())?;
            info!("catalog valid: {} platform entries", catalog.platforms.len());
            Ok(())
        }
        _ => unreachable!("clap enforces subcommand_required"),
    }
}

async fn build_scan_result(root: &std::path::Path, config: &Config) -> Result<scanner::ScanResult> {
    let catalog = platform_catalog::load_catalog(config.scanner.platform_catalog_path.as_deref())?;
    let overrides = override_rules::OverrideRules::load(config.identification_overrides.path.as_deref())?;
    let dat_index = if config.dats.index_path.exists() {
        Some(Arc::new(
            dat_index::DatIndex::open(&config.dats.index_path, &config.dats.sharding).await?,
        ))
    } else {
        None
    };

    let scanner = scanner::Scanner::new(
        config.scanner.clone(),
        catalog,
        overrides,
        dat_index,
        config.performance.optimization.lazy_archive_extraction,
    );
    let cancel = CancelToken::new();
    scanner.scan(root, &cancel, |_done, _total| {}).await
}
