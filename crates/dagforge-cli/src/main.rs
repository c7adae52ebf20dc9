use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dagforge_catalog::MockAdapter;
use dagforge_core::{Config, ConfigError, ExitCode, Report, SecretScrubber, Severity};
use dagforge_engine::{
    compile_manifest, merge_from_artifact, select_nodes, write_compiled, CompileOptions, SelectionError, SelectionSpec,
};
use dagforge_incremental::IncrementalParser;
use dagforge_manifest::{Manifest, ManifestError, NodeId, ResourceType};
use dagforge_parser::{ParseError, ParseOutput};
use dagforge_runner::{NodeStatus, RunOptions, RunResults, Runner};

const CONFIG_FILE: &str = "dagforge.toml";
const MANIFEST_FILE: &str = "manifest.json";

/// dagforge - parse, compile and run a SQL project graph
#[derive(Parser)]
#[command(name = "dagforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: <project-dir>/dagforge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project root containing dbt_project.yml
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Default)]
struct SelectArgs {
    /// Node selectors (name, path:, tag:, state:modified, with +/@ graph operators)
    #[arg(short, long, num_args = 1..)]
    select: Vec<String>,

    /// Selectors to remove from the selection
    #[arg(long, num_args = 1..)]
    exclude: Vec<String>,

    /// Directory holding the reference manifest.json for state: selectors
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the project and write target/manifest.json
    Parse,

    /// Compile selected nodes and write target/compiled/
    Compile {
        #[command(flatten)]
        selection: SelectArgs,

        /// Resolve unselected upstream nodes against the --state manifest
        #[arg(long, requires = "state")]
        defer: bool,
    },

    /// Execute selected nodes and write target/run_results.json
    Run {
        #[command(flatten)]
        selection: SelectArgs,

        #[arg(long, requires = "state")]
        defer: bool,

        /// Concurrent statements (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Stop scheduling new nodes after the first failure
        #[arg(short = 'x', long)]
        fail_fast: bool,
    },

    /// List selected nodes
    Ls {
        #[command(flatten)]
        selection: SelectArgs,

        /// Only list nodes of this resource type
        #[arg(long)]
        resource_type: Option<String>,

        #[arg(short, long, value_enum, default_value_t = LsOutput::Selector)]
        output: LsOutput,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LsOutput {
    /// Dotted fqn, one per line
    Selector,
    /// Unique ids, one per line
    Id,
    /// One JSON object per line
    Json,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            exit_code_for(&err)
        }
    };
    std::process::ExitCode::from(code.code() as u8)
}

/// `RUST_LOG` wins over `--verbose`
fn init_tracing(verbose: bool) {
    let default = if verbose { "dagforge=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// User-facing failures exit 1; anything else is internal
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ParseError>().is_some()
        || err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<SelectionError>().is_some()
        || err.downcast_ref::<ManifestError>().is_some()
    {
        ExitCode::Failure
    } else {
        ExitCode::Internal
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    if cli.verbose {
        eprintln!(
            "{} project {} (target {}, adapter {})",
            "Using".cyan(),
            config.project_root.display(),
            config.target.name,
            config.target.adapter_type
        );
    }

    match cli.command {
        Commands::Parse => parse_command(&config),
        Commands::Compile { selection, defer } => compile_command(&config, &selection, defer),
        Commands::Run {
            selection,
            defer,
            threads,
            fail_fast,
        } => {
            let mut config = config;
            if let Some(threads) = threads {
                config.threads = threads.max(1);
            }
            config.fail_fast |= fail_fast;
            run_command(&config, &selection, defer).await
        }
        Commands::Ls {
            selection,
            resource_type,
            output,
        } => ls_command(&config, &selection, resource_type.as_deref(), output),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let project_dir = cli.project_dir.canonicalize().unwrap_or_else(|_| cli.project_dir.clone());

    // .env values are visible to env_var() and the secret scrubber
    if let Err(err) = dotenvy::from_path(project_dir.join(".env")) {
        if !err.not_found() {
            tracing::warn!(error = %err, "Ignoring unreadable .env file");
        }
    }

    let path = cli.config.clone().or_else(|| {
        let candidate = project_dir.join(CONFIG_FILE);
        candidate.exists().then_some(candidate)
    });

    let mut config = match path {
        Some(path) => {
            let mut config =
                Config::from_file(&path).with_context(|| format!("Failed to load config {}", path.display()))?;
            if cli.config.is_some() {
                config.project_root = project_dir;
            }
            config
        }
        None => {
            if cli.verbose {
                eprintln!("{}", "No config file found, using defaults".yellow());
            }
            Config {
                project_root: project_dir,
                ..Config::default()
            }
        }
    };
    config.threads = config.threads.max(1);
    Ok(config)
}

struct Loaded {
    session: IncrementalParser,
    output: ParseOutput,
    selected: BTreeSet<NodeId>,
    state: Option<Manifest>,
}

impl Loaded {
    fn order(&self) -> Vec<NodeId> {
        self.output
            .linked
            .as_ref()
            .map(|linked| linked.ordered(&self.selected))
            .unwrap_or_default()
    }
}

fn parse_project(config: &Config) -> Result<(IncrementalParser, ParseOutput)> {
    let mut session = IncrementalParser::for_config(config)?;
    let output = session.parse()?;
    if config.flags.partial_parse {
        if let Err(err) = session.save() {
            tracing::warn!(error = %err, "Could not save partial parse state");
        }
    }

    let scrubber = SecretScrubber::from_env(&config.secret_env_prefix);
    let path = config.target_dir().join(MANIFEST_FILE);
    output.manifest.write(&path, &scrubber)?;
    tracing::info!(path = %path.display(), "Wrote manifest");
    Ok((session, output))
}

fn load_selected(config: &Config, args: &SelectArgs) -> Result<Loaded> {
    let (session, output) = parse_project(config)?;

    let state = match &args.state {
        Some(dir) => {
            let path = if dir.is_dir() { dir.join(MANIFEST_FILE) } else { dir.clone() };
            Some(Manifest::from_file(&path)?)
        }
        None => None,
    };

    let selected = match &output.linked {
        Some(linked) => {
            let spec = SelectionSpec::parse(&args.select, &args.exclude)?;
            select_nodes(&output.manifest, &linked.graph, &spec, state.as_ref())?
        }
        None => BTreeSet::new(),
    };

    Ok(Loaded {
        session,
        output,
        selected,
        state,
    })
}

fn parse_command(config: &Config) -> Result<ExitCode> {
    let (_session, output) = parse_project(config)?;

    let stats = output.manifest.stats();
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Parse".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
    println!(
        "Files: {} ({} reused from partial parse)",
        output.stats.files, output.stats.reused
    );
    for (kind, count) in stats.iter().filter(|(_, count)| **count > 0) {
        println!("  {:<16} {}", kind, count);
    }

    print_report_summary(&output.report);
    Ok(report_exit_code(&output.report))
}

fn compile_command(config: &Config, args: &SelectArgs, defer: bool) -> Result<ExitCode> {
    let loaded = load_selected(config, args)?;
    let order = loaded.order();

    let Loaded {
        session,
        output,
        selected,
        state,
    } = loaded;
    let mut report = output.report;
    let mut manifest = output.manifest;

    let mut options = CompileOptions::from_config(config, session.parser().resolve_context());
    if defer {
        if let Some(state) = &state {
            merge_from_artifact(&mut manifest, state);
            options = options.with_defer(selected.clone());
        }
    }

    println!("{} {} nodes", "Compiling".cyan(), order.len());
    report.merge(compile_manifest(&mut manifest, &order, options));

    let target_dir = config.target_dir();
    let written = write_compiled(&manifest, &target_dir)?;
    let scrubber = SecretScrubber::from_env(&config.secret_env_prefix);
    manifest.write(&target_dir.join(MANIFEST_FILE), &scrubber)?;
    println!(
        "{} {} files to {}",
        "Wrote".green(),
        written.len(),
        target_dir.join("compiled").display()
    );

    print_report_summary(&report);
    Ok(report_exit_code(&report))
}

async fn run_command(config: &Config, args: &SelectArgs, defer: bool) -> Result<ExitCode> {
    let loaded = load_selected(config, args)?;
    let order = loaded.order();
    let Some(linked) = loaded.output.linked.clone() else {
        print_report_summary(&loaded.output.report);
        return Ok(ExitCode::Failure);
    };

    let Loaded {
        session,
        output,
        selected,
        state,
    } = loaded;
    let mut manifest = output.manifest;

    let mut compile = CompileOptions::from_config(config, session.parser().resolve_context());
    if defer {
        if let Some(state) = &state {
            merge_from_artifact(&mut manifest, state);
            compile = compile.with_defer(selected.clone());
        }
    }

    let adapter = MockAdapter::new().with_adapter_type(config.target.adapter_type.clone());
    let runner = Runner::new(
        Arc::new(manifest),
        linked.graph,
        Arc::new(adapter),
        compile,
        RunOptions::from_config(config),
    )
    .with_blocking_errors(&output.report);

    let canceller = runner.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cancelling open statements...".yellow());
            canceller.cancel();
        }
    });

    println!(
        "{} {} nodes with {} threads",
        "Running".cyan(),
        order.len(),
        config.threads
    );
    let outcome = runner.run(&order).await;

    let scrubber = SecretScrubber::from_env(&config.secret_env_prefix);
    let path = outcome.results.write(&config.target_dir(), &scrubber)?;
    tracing::info!(path = %path.display(), "Wrote run results");

    let mut report = output.report;
    report.merge(outcome.report);
    print_run_results(&outcome.results);
    print_report_summary(&report);

    Ok(outcome.results.exit_code())
}

fn ls_command(
    config: &Config,
    args: &SelectArgs,
    resource_type: Option<&str>,
    output: LsOutput,
) -> Result<ExitCode> {
    let resource_type = match resource_type {
        Some(raw) => Some(
            ResourceType::parse(raw).ok_or_else(|| ConfigError::InvalidValue(format!("unknown resource type '{}'", raw)))?,
        ),
        None => None,
    };

    let loaded = load_selected(config, args)?;
    let manifest = &loaded.output.manifest;
    let nodes = loaded
        .selected
        .iter()
        .filter_map(|id| manifest.get_node(id))
        .filter(|node| resource_type.map_or(true, |rt| node.resource_type == rt));

    for node in nodes {
        match output {
            LsOutput::Selector => println!("{}", node.fqn.join(".")),
            LsOutput::Id => println!("{}", node.unique_id),
            LsOutput::Json => println!(
                "{}",
                serde_json::json!({
                    "unique_id": node.unique_id,
                    "name": node.name,
                    "resource_type": node.resource_type.as_str(),
                    "package_name": node.package_name,
                    "original_file_path": node.original_file_path,
                })
            ),
        }
    }

    for diag in loaded.output.report.errors() {
        eprintln!("{} {}: {}", "ERROR".red().bold(), diag.code, diag.message);
    }
    Ok(report_exit_code(&loaded.output.report))
}

fn report_exit_code(report: &Report) -> ExitCode {
    if report.has_errors() {
        ExitCode::Failure
    } else {
        ExitCode::Success
    }
}

fn print_run_results(results: &RunResults) {
    println!();
    let total = results.results.len();
    for (index, result) in results.results.iter().enumerate() {
        let status = match result.status {
            NodeStatus::Success => "OK".green().bold(),
            NodeStatus::Pass => "PASS".green().bold(),
            NodeStatus::Warn => "WARN".yellow().bold(),
            NodeStatus::Skipped => "SKIP".yellow(),
            NodeStatus::Error => "ERROR".red().bold(),
            NodeStatus::Fail => "FAIL".red().bold(),
        };
        print!(
            "  {:>3} of {} [{}] {} ({:.2}s)",
            index + 1,
            total,
            status,
            result.unique_id,
            result.execution_time
        );
        match &result.message {
            Some(message) if result.status != NodeStatus::Success && result.status != NodeStatus::Pass => {
                println!(": {}", message)
            }
            _ => println!(),
        }
    }

    println!();
    println!(
        "Finished in {:.2}s. PASS={} WARN={} ERROR={} SKIP={} TOTAL={}",
        results.elapsed_time,
        results.count(NodeStatus::Success) + results.count(NodeStatus::Pass),
        results.count(NodeStatus::Warn),
        results.count(NodeStatus::Error) + results.count(NodeStatus::Fail),
        results.count(NodeStatus::Skipped),
        total
    );
    if results.interrupted {
        println!("{}", "Run was interrupted".red().bold());
    }
}

fn print_report_summary(report: &Report) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Diagnostics".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if report.summary.errors > 0 {
        println!("  Errors:   {}", format!("{}", report.summary.errors).red().bold());
    } else {
        println!("  Errors:   {}", format!("{}", report.summary.errors).green());
    }

    if report.summary.warnings > 0 {
        println!("  Warnings: {}", format!("{}", report.summary.warnings).yellow());
    } else {
        println!("  Warnings: {}", format!("{}", report.summary.warnings).green());
    }
    println!();

    if report.diagnostics.is_empty() {
        println!("{}", "✓ No issues found!".green().bold());
        return;
    }

    for diag in &report.diagnostics {
        let severity_str = match diag.severity {
            Severity::Error => "ERROR".red().bold(),
            Severity::Warn => "WARN".yellow().bold(),
            Severity::Info => "INFO".cyan(),
        };
        println!("  [{}] {}: {}", severity_str, diag.code, diag.message);

        if let Some(loc) = &diag.location {
            print!("    at {}", loc.file);
            if let Some(line) = loc.line {
                print!(":{}", line);
            }
            println!();
        }
        if !diag.nodes.is_empty() {
            println!("    nodes: {}", diag.nodes.join(", ").dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn selection_flags_parse() {
        let cli = Cli::parse_from([
            "dagforge",
            "run",
            "--select",
            "orders+",
            "tag:nightly",
            "--exclude",
            "legacy",
            "--threads",
            "8",
            "-x",
        ]);
        match cli.command {
            Commands::Run {
                selection,
                threads,
                fail_fast,
                ..
            } => {
                assert_eq!(selection.select, vec!["orders+", "tag:nightly"]);
                assert_eq!(selection.exclude, vec!["legacy"]);
                assert_eq!(threads, Some(8));
                assert!(fail_fast);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn defer_requires_state() {
        assert!(Cli::try_parse_from(["dagforge", "compile", "--defer"]).is_err());
        assert!(Cli::try_parse_from(["dagforge", "compile", "--defer", "--state", "prod"]).is_ok());
    }

    #[test]
    fn user_errors_exit_one() {
        let err = anyhow::Error::from(ConfigError::InvalidValue("threads".to_string())).context("loading");
        assert_eq!(exit_code_for(&err), ExitCode::Failure);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), ExitCode::Internal);
    }

    #[test]
    fn missing_project_fails_parse() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            project_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let code = parse_project(&config).err().map(|e| exit_code_for(&e));
        assert_eq!(code, Some(ExitCode::Failure));
    }
}
