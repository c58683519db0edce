//! Command line interface for the FHIR Mapping Language
//!
//! Parses, renders, runs and analyses maps, and evaluates standalone FHIRPath
//! expressions.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{LevelFilter, debug};
use serde_json::Value;

use octofhir_fhirmap::model::TypeInfo;
use octofhir_fhirmap::transform::InMemoryMapRegistry;
use octofhir_fhirmap::{
    EngineConfig, FhirMapError, FhirPathValue, MapAnalyzer, MockStructureProvider, Node,
    StructureMap, StructureMapEngine, StructureProvider, render,
};

#[derive(Parser)]
#[command(name = "octofhir-fhirmap")]
#[command(about = "Parse, run and analyse FHIR Mapping Language maps")]
#[command(version)]
#[command(author = "OctoFHIR Team <funyloony@gmail.com>")]
struct Cli {
    /// JSON engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON array of extra type definitions
    #[arg(long, global = true)]
    types: Option<PathBuf>,
    /// Log rule execution (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a map and print its rule tree as JSON
    Parse {
        /// Map file
        map: PathBuf,
        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },
    /// Parse a map and print it back in canonical form
    Render {
        /// Map file
        map: PathBuf,
    },
    /// Run a map over a JSON document
    Transform {
        /// Map file
        map: PathBuf,
        /// Source document (reads from stdin if not provided)
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Type of the source when it has no resourceType
        #[arg(long)]
        source_type: Option<String>,
        /// Type of the target to create
        #[arg(long)]
        target_type: Option<String>,
        /// Further maps that imports and dependent groups may resolve to
        #[arg(short, long)]
        import: Vec<PathBuf>,
        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },
    /// Analyse a map and print the summary and generated profiles
    Analyze {
        /// Map file
        map: PathBuf,
        /// Further maps that imports and dependent groups may resolve to
        #[arg(short, long)]
        import: Vec<PathBuf>,
        /// Print the analysis as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a FHIRPath expression
    Expr {
        /// FHIRPath expression
        expression: String,
        /// JSON document to evaluate against
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn main() {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if let Err(err) = run(cli) {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let provider = load_provider(cli.types.as_deref())?;

    match cli.command {
        Commands::Parse { map, pretty } => {
            let map = read_map(&map)?;
            print_json(&serde_json::to_value(&map)?, pretty)
        }
        Commands::Render { map } => {
            print!("{}", render(&read_map(&map)?));
            Ok(())
        }
        Commands::Transform {
            map,
            source,
            source_type,
            target_type,
            import,
            pretty,
        } => {
            let engine = StructureMapEngine::new()
                .with_provider(provider)
                .with_registry(load_registry(&import)?)
                .with_config(config);
            let map = read_map(&map)?;
            let source: Value = serde_json::from_str(&read_input(source.as_deref())?)
                .context("parsing source document")?;
            let out = engine.transform_json(&source, source_type.as_deref(), &map, target_type.as_deref())?;
            print_json(&out, pretty)
        }
        Commands::Analyze { map, import, json } => {
            let analyzer = MapAnalyzer::new()
                .with_provider(provider)
                .with_registry(load_registry(&import)?)
                .with_config(config);
            let analysis = analyzer.analyze(&read_map(&map)?)?;
            if json {
                return print_json(&serde_json::to_value(&analysis)?, true);
            }
            println!("{}", analysis.summary_table());
            for profile in &analysis.profiles {
                println!(
                    "{} {} ({} elements)",
                    "profile".green().bold(),
                    profile.url,
                    profile.differential.len()
                );
            }
            Ok(())
        }
        Commands::Expr { expression, file } => {
            let engine = octofhir_fhirmap::FhirPathEngine::new().with_provider(provider.clone());
            let parsed = engine.parse(&expression)?;
            let focus = match file {
                Some(path) => {
                    let json: Value = serde_json::from_str(&read_input(Some(&path))?)
                        .with_context(|| format!("parsing {}", path.display()))?;
                    Some(FhirPathValue::Node(Node::from_json(&json, None, Some(provider.as_ref()))?))
                }
                None => None,
            };
            let results = engine.evaluate(focus.as_ref(), &parsed, None)?;
            let values: Vec<Value> = results.iter().map(FhirPathValue::to_json).collect();
            print_json(&Value::Array(values), true)
        }
    }
}

fn read_map(path: &Path) -> Result<StructureMap> {
    let text = read_input(Some(path))?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("map");
    StructureMapEngine::new()
        .parse_map(&text, name)
        .map_err(|err| describe(err, path))
}

fn load_registry(imports: &[PathBuf]) -> Result<Arc<InMemoryMapRegistry>> {
    let registry = InMemoryMapRegistry::new();
    for path in imports {
        let map = read_map(path)?;
        debug!("registered {} from {}", map.url, path.display());
        registry.add_map(map);
    }
    Ok(Arc::new(registry))
}

fn load_provider(types: Option<&Path>) -> Result<Arc<dyn StructureProvider>> {
    let mut provider = MockStructureProvider::new();
    if let Some(path) = types {
        let text = read_input(Some(path))?;
        let infos: Vec<TypeInfo> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for info in infos {
            provider.add_type(info);
        }
    }
    Ok(Arc::new(provider))
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer).context("reading stdin")?;
            if buffer.trim().is_empty() {
                bail!("no input on stdin");
            }
            Ok(buffer)
        }
    }
}

fn describe(err: FhirMapError, path: &Path) -> anyhow::Error {
    match err.location() {
        Some(location) => anyhow::anyhow!("{}:{location}: {}", path.display(), err.message()),
        None => anyhow::Error::new(err).context(format!("parsing {}", path.display())),
    }
}

fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
