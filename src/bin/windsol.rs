use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use windsol::cache::LocalCache;
use windsol::catalog::SiteCatalog;
use windsol::config::ConfigLoader;
use windsol::domain::{
    assign_capacities, parse_generator_list, parse_node_list, require_capacities, DemandNode,
    NodeId, ResourceCategory,
};
use windsol::error::WindsolError;
use windsol::fetch::KindProfile;
use windsol::output::JsonOutput;
use windsol::remote::RepositoryFetcher;
use windsol::resolver::{ResolveRequest, Resolver};

#[derive(Parser)]
#[command(name = "windsol")]
#[command(about = "Resolve grid locations to wind/solar resource sites and cache their data")]
#[command(version, author)]
struct Cli {
    /// Path to a windsol.json configuration file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Resolve weather nodes to their nearest sites")]
    Weather(WeatherArgs),
    #[command(about = "Allocate generation nodes across resource sites")]
    Power(PowerArgs),
    #[command(about = "Inspect or rebuild the local cache", subcommand)]
    Cache(CacheCommand),
}

#[derive(Args)]
struct WeatherArgs {
    #[arg(short = 't', long = "type")]
    category: ResourceCategory,

    /// Latitude and longitude of a single node (node id 1).
    #[arg(short, long, num_args = 2, value_names = ["LAT", "LON"], conflicts_with = "nodes")]
    node: Option<Vec<f64>>,

    /// Path to a node list csv: node_id,latitude,longitude.
    #[arg(long)]
    nodes: Option<String>,
}

#[derive(Args)]
struct PowerArgs {
    #[arg(short = 't', long = "type")]
    category: ResourceCategory,

    /// Latitude and longitude of a single node (node id 1).
    #[arg(short, long, num_args = 2, value_names = ["LAT", "LON"], conflicts_with = "nodes")]
    node: Option<Vec<f64>>,

    /// Path to a node list csv: node_id,latitude,longitude[,capacity].
    #[arg(long)]
    nodes: Option<String>,

    /// Required capacity in MW for a single --node.
    #[arg(long, conflicts_with = "generators")]
    capacity: Option<f64>,

    /// Path to a generator list csv: node_id,capacity.
    #[arg(long)]
    generators: Option<String>,

    /// Also fetch forecast files for every allocated site.
    #[arg(long)]
    forecasts: bool,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Show cache size and per-category contents")]
    Status,
    #[command(about = "Rebuild the cache indexes from the files on disk")]
    Refresh,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(windsol) = report.downcast_ref::<WindsolError>() {
            return ExitCode::from(map_exit_code(windsol));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &WindsolError) -> u8 {
    match error {
        WindsolError::ConfigRead(_)
        | WindsolError::ConfigParse(_)
        | WindsolError::MissingRepository
        | WindsolError::RepositoryConflict
        | WindsolError::InvalidNodeLine { .. }
        | WindsolError::MissingCapacity(_)
        | WindsolError::UnknownSite { .. } => 2,
        WindsolError::FetchHttp(_)
        | WindsolError::FetchStatus { .. }
        | WindsolError::FetchMissing(_) => 3,
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
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;
    let cache = LocalCache::from_config(&config).into_diagnostic()?;
    print_cache_banner(&cache).into_diagnostic()?;

    match cli.command {
        Commands::Weather(args) => {
            let nodes = load_nodes(args.node.as_deref(), args.nodes.as_deref(), None)
                .into_diagnostic()?;
            run_resolve(
                nodes,
                args.category,
                KindProfile::Weather,
                &config,
                &cache,
            )
        }
        Commands::Power(args) => {
            let mut nodes = load_nodes(args.node.as_deref(), args.nodes.as_deref(), args.capacity)
                .into_diagnostic()?;
            if let Some(path) = &args.generators {
                let text = fs::read_to_string(path)
                    .map_err(|err| WindsolError::Filesystem(err.to_string()))
                    .into_diagnostic()?;
                let generators = parse_generator_list(&text).into_diagnostic()?;
                assign_capacities(&mut nodes, &generators);
            }
            require_capacities(&nodes).into_diagnostic()?;
            run_resolve(
                nodes,
                args.category,
                KindProfile::Generation {
                    forecasts: args.forecasts,
                },
                &config,
                &cache,
            )
        }
        Commands::Cache(CacheCommand::Status) => {
            let status = cache.status().into_diagnostic()?;
            JsonOutput::print_cache_status(&status).into_diagnostic()?;
            Ok(())
        }
        Commands::Cache(CacheCommand::Refresh) => {
            for category in ResourceCategory::ALL {
                let index = cache.rebuild_index(category).into_diagnostic()?;
                eprintln!("{category}: {} files indexed", index.entries.len());
            }
            Ok(())
        }
    }
}

fn run_resolve(
    nodes: Vec<DemandNode>,
    category: ResourceCategory,
    profile: KindProfile,
    config: &windsol::config::ResolvedConfig,
    cache: &LocalCache,
) -> miette::Result<()> {
    let fetcher = RepositoryFetcher::from_source(config.repository().into_diagnostic()?)
        .into_diagnostic()?;
    let catalog = SiteCatalog::load_or_fetch(category, &cache.manifest_path(category), &fetcher)
        .into_diagnostic()?;

    let resolver = Resolver::new(&catalog, cache, config.workers);
    let resolution = resolver
        .resolve(
            &ResolveRequest {
                nodes,
                category,
                profile,
            },
            &fetcher,
        )
        .into_diagnostic()?;

    JsonOutput::print_resolution(&resolution).into_diagnostic()?;
    Ok(())
}

fn load_nodes(
    node: Option<&[f64]>,
    nodes_path: Option<&str>,
    capacity: Option<f64>,
) -> Result<Vec<DemandNode>, WindsolError> {
    match (node, nodes_path) {
        (Some(coords), None) => {
            let node = match capacity {
                Some(capacity) => {
                    DemandNode::generation(NodeId(1), coords[0], coords[1], capacity)
                }
                None => DemandNode::weather(NodeId(1), coords[0], coords[1]),
            };
            Ok(vec![node])
        }
        (None, Some(path)) => {
            let text = fs::read_to_string(path)
                .map_err(|err| WindsolError::Filesystem(err.to_string()))?;
            parse_node_list(&text)
        }
        _ => Err(WindsolError::Filesystem(
            "supply either --node LAT LON or --nodes <csv>".to_string(),
        )),
    }
}

fn print_cache_banner(cache: &LocalCache) -> Result<(), WindsolError> {
    let status = cache.status()?;
    let max = status
        .max_gb
        .map(|gb| format!("{gb:.2} GB"))
        .unwrap_or_else(|| "unbounded".to_string());
    let mut per_category = String::new();
    for category in &status.categories {
        per_category.push_str(&format!(
            " {} {:.2} GB",
            category.category, category.size_gb
        ));
    }
    eprintln!(
        "local cache at {}: {:.2} GB of {max} in use;{per_category}",
        status.root, status.used_gb
    );
    Ok(())
}
