use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pathrank_core::{DerivedGraphKey, GraphKey, ValidationError};

pub const DEFAULT_RUN_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[arg(long, value_parser = parse_graph_key, help = "Base graph key to ingest under")]
    pub graph_key: GraphKey,

    #[arg(long, default_value_t = 0, help = "Upload batch tag stored with every row")]
    pub batch: i64,

    #[arg(help = "JSON file holding the rows to ingest")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct BatchArgs {
    #[arg(long, value_parser = parse_derived_graph_key, help = "Derived graph key (<base>-<generation>)")]
    pub graph_key: DerivedGraphKey,

    #[arg(long, help = "Rows per call; defaults to the workspace config")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct BaseKeyArgs {
    #[arg(long, value_parser = parse_graph_key, help = "Base graph key")]
    pub graph_key: GraphKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct DerivedKeyArgs {
    #[arg(long, value_parser = parse_derived_graph_key, help = "Current derived graph key (<base>-<generation>)")]
    pub graph_key: DerivedGraphKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RegisterBuildsArgs {
    #[arg(help = "JSON file holding an array of build records")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RegisterRepositoryArgs {
    #[arg(long, help = "Repository id used by path ranks")]
    pub id: i64,

    #[arg(long, help = "Repository name carried by definitions")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct MarkVisibleArgs {
    #[arg(long, help = "Repository whose branch tips were recomputed")]
    pub repository_id: i64,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "BUILD_ID",
        help = "Comma-separated builds visible at a tip; replaces the previous set"
    )]
    pub build_ids: Vec<i64>,

    #[arg(long, help = "The tip belongs to the default branch")]
    pub default_branch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunArgs {
    #[arg(long, value_parser = parse_derived_graph_key, help = "Current derived graph key (<base>-<generation>)")]
    pub graph_key: DerivedGraphKey,

    #[arg(
        long,
        default_value_t = DEFAULT_RUN_INTERVAL_MS,
        help = "Pause between rounds"
    )]
    pub interval_ms: u64,

    #[arg(long, help = "Run a single round and exit")]
    pub once: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Record builds and their project identity from a JSON array
    RegisterBuilds(RegisterBuildsArgs),
    /// Record a repository id and name
    RegisterRepository(RegisterRepositoryArgs),
    /// Replace the builds visible at a repository's branch tips
    MarkVisible(MarkVisibleArgs),
    /// Append definition facts read from a JSON array
    InsertDefinitions(IngestArgs),
    /// Append reference sets read from a JSON array, one row per set
    InsertReferences(IngestArgs),
    /// Fold one batch of unprocessed reference sets into path count inputs
    Fold(BatchArgs),
    /// Consume one batch of path count inputs into path ranks
    WriteRanks(BatchArgs),
    /// Delete definitions and references of builds no longer visible at a branch tip
    VacuumStaleData(BaseKeyArgs),
    /// Delete processed markers and inputs of every other generation
    VacuumGraphs(DerivedKeyArgs),
    /// Delete path ranks outside the retained generations
    VacuumRanks(DerivedKeyArgs),
    /// Check processed markers and path count inputs of a generation
    Verify(DerivedKeyArgs),
    /// Drain aggregation and ranking, then vacuum, on an interval
    Run(RunArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Path ranking aggregation daemon")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .pathrank/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_graph_key(value: &str) -> Result<GraphKey, String> {
    value
        .parse()
        .map_err(|err: ValidationError| err.to_string())
}

fn parse_derived_graph_key(value: &str) -> Result<DerivedGraphKey, String> {
    value
        .parse()
        .map_err(|err: ValidationError| err.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse cli")
    }

    #[test]
    fn ingest_subcommands_parse_key_batch_and_file() {
        let cli = parse(&[
            "pathrankd",
            "insert-definitions",
            "--graph-key",
            "dev",
            "--batch",
            "7",
            "defs.json",
        ]);

        assert_eq!(cli.workspace, PathBuf::from("."));
        assert_eq!(cli.log_format, LogFormat::Human);
        assert_eq!(
            cli.command,
            Commands::InsertDefinitions(IngestArgs {
                graph_key: GraphKey::new("dev").expect("graph key"),
                batch: 7,
                file: PathBuf::from("defs.json"),
            })
        );
    }

    #[test]
    fn ingest_rejects_derived_keys() {
        let err = Cli::try_parse_from([
            "pathrankd",
            "insert-references",
            "--graph-key",
            "dev-12",
            "refs.json",
        ])
        .expect_err("derived key is not a base key");
        assert!(err.to_string().contains("dev-12"));
    }

    #[test]
    fn fold_parses_derived_key_and_optional_limit() {
        let cli = parse(&["pathrankd", "fold", "--graph-key", "dev-12", "--limit", "50"]);
        assert_eq!(
            cli.command,
            Commands::Fold(BatchArgs {
                graph_key: GraphKey::new("dev").expect("graph key").derive(12),
                limit: Some(50),
            })
        );

        let cli = parse(&["pathrankd", "write-ranks", "--graph-key", "dev-12"]);
        assert!(matches!(
            cli.command,
            Commands::WriteRanks(BatchArgs { limit: None, .. })
        ));
    }

    #[test]
    fn vacuum_subcommands_take_the_matching_key_kind() {
        let cli = parse(&["pathrankd", "vacuum-stale-data", "--graph-key", "dev"]);
        assert!(matches!(cli.command, Commands::VacuumStaleData(_)));

        let cli = parse(&["pathrankd", "vacuum-ranks", "--graph-key", "dev-3"]);
        assert!(matches!(cli.command, Commands::VacuumRanks(_)));

        assert!(
            Cli::try_parse_from(["pathrankd", "vacuum-graphs", "--graph-key", "dev"]).is_err()
        );
    }

    #[test]
    fn run_parses_interval_once_and_global_flags() {
        let cli = parse(&[
            "pathrankd",
            "run",
            "--graph-key",
            "dev-4",
            "--once",
            "--workspace",
            "/tmp/ws",
            "--log-format",
            "json",
        ]);

        assert_eq!(cli.workspace, PathBuf::from("/tmp/ws"));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(
            cli.command,
            Commands::Run(RunArgs {
                graph_key: GraphKey::new("dev").expect("graph key").derive(4),
                interval_ms: DEFAULT_RUN_INTERVAL_MS,
                once: true,
            })
        );
    }

    #[test]
    fn catalog_subcommands_parse() {
        let cli = parse(&[
            "pathrankd",
            "mark-visible",
            "--repository-id",
            "50",
            "--build-ids",
            "2,3",
            "--default-branch",
        ]);
        assert_eq!(
            cli.command,
            Commands::MarkVisible(MarkVisibleArgs {
                repository_id: 50,
                build_ids: vec![2, 3],
                default_branch: true,
            })
        );

        let cli = parse(&["pathrankd", "register-repository", "--id", "1", "--name", "deadbeef"]);
        assert_eq!(
            cli.command,
            Commands::RegisterRepository(RegisterRepositoryArgs {
                id: 1,
                name: "deadbeef".to_owned(),
            })
        );
    }

    #[test]
    fn log_format_rejects_unknown_values() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(LogFormat::Json.as_str(), "json");
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
