use std::time::Duration;

use anyhow::{Context, Result};
use pathrank_config::{ensure_workspace_config, normalize_config, validate_config};
use pathrank_core::BuildId;
use pathrank_store::{RankingStore, SqliteRankingStore};
use pathrankd::cli::{Cli, Commands, LogFormat, parse_cli};
use pathrankd::passes::{read_builds, read_definitions, read_reference_sets, run_loop};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Human => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            pathrank_config::config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        eprintln!(
            "PATHRANK config warning [{}]: {}",
            warning.code, warning.message
        );
    }
    let config = normalize_config(config);

    let store = SqliteRankingStore::open(&workspace, &config)
        .with_context(|| format!("failed to open ranking store in {}", workspace.display()))?;
    tracing::debug!(
        sqlite_path = %store.sqlite_path().display(),
        log_format = cli.log_format.as_str(),
        "ranking store opened"
    );

    match cli.command {
        Commands::RegisterBuilds(args) => {
            let builds = read_builds(&args.file)?;
            for build in &builds {
                store
                    .catalog()
                    .upsert_build(build)
                    .with_context(|| format!("failed to register build {}", build.id))?;
            }
            println!("REGISTER: builds={}", builds.len());
        }
        Commands::RegisterRepository(args) => {
            store
                .catalog()
                .upsert_repository(args.id, &args.name)
                .with_context(|| format!("failed to register repository {}", args.name))?;
            println!("REGISTER: repository id={} name={}", args.id, args.name);
        }
        Commands::MarkVisible(args) => {
            let build_ids = args.build_ids.iter().copied().map(BuildId).collect::<Vec<_>>();
            let replaced = store
                .catalog()
                .replace_visible_at_tip(args.repository_id, &build_ids, args.default_branch)
                .context("failed to replace visible builds")?;
            println!(
                "VISIBLE: repository_id={} replaced={replaced} marked={}",
                args.repository_id,
                build_ids.len()
            );
        }
        Commands::InsertDefinitions(args) => {
            let definitions = read_definitions(&args.file)?;
            let written = store
                .insert_definitions(&args.graph_key, args.batch, &definitions)
                .context("failed to insert definitions")?;
            println!("INGEST: definitions_written={written}");
        }
        Commands::InsertReferences(args) => {
            let reference_sets = read_reference_sets(&args.file)?;
            for references in &reference_sets {
                store
                    .insert_references(&args.graph_key, args.batch, references)
                    .with_context(|| {
                        format!("failed to insert references of build {}", references.build_id)
                    })?;
            }
            println!("INGEST: reference_sets_written={}", reference_sets.len());
        }
        Commands::Fold(args) => {
            let limit = args.limit.unwrap_or(config.ranking.fold_batch_limit);
            let (claimed, written) = store
                .fold_references_into_path_counts(&args.graph_key, limit)
                .context("aggregation failed")?;
            println!("FOLD: references_claimed={claimed} path_counts_written={written}");
        }
        Commands::WriteRanks(args) => {
            let batch_size = args.limit.unwrap_or(config.ranking.rank_batch_size);
            let (written, consumed) = store
                .write_ranks(&args.graph_key, batch_size)
                .context("rank writing failed")?;
            println!("RANKS: ranks_written={written} inputs_consumed={consumed}");
        }
        Commands::VacuumStaleData(args) => {
            let (definitions, references) = store
                .vacuum_stale_definitions_and_references(&args.graph_key)
                .context("visibility vacuum failed")?;
            println!(
                "VACUUM: definitions_deleted={definitions} references_deleted={references}"
            );
        }
        Commands::VacuumGraphs(args) => {
            let (markers, inputs) = store
                .vacuum_stale_graphs(&args.graph_key)
                .context("lineage vacuum failed")?;
            println!("VACUUM: markers_deleted={markers} inputs_deleted={inputs}");
        }
        Commands::VacuumRanks(args) => {
            let ranks = store
                .vacuum_stale_ranks(&args.graph_key)
                .context("rank vacuum failed")?;
            println!("VACUUM: ranks_deleted={ranks}");
        }
        Commands::Verify(args) => {
            store
                .verify_consistency(&args.graph_key)
                .with_context(|| format!("verification of {} failed", args.graph_key))?;
            println!("VERIFY: graph_key={} consistent", args.graph_key);
        }
        Commands::Run(args) => {
            run_loop(
                &store,
                &args.graph_key,
                &config.ranking,
                Duration::from_millis(args.interval_ms),
                args.once,
            )?;
        }
    }

    Ok(())
}
