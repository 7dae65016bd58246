//! Command-line interface for Fieldwork.
//!
//! # Usage
//!
//! ```bash
//! # Validate a resolver configuration
//! fieldwork check resolvers.json
//!
//! # Execute a query plan against in-memory entities, twice, sharing the cache
//! fieldwork run --config resolvers.json --entities entities.json --query plan.json --repeat 2
//!
//! # Vary cache contexts through request data
//! fieldwork run -c resolvers.json --query plan.json --context 'languages={"language_interface":"de"}'
//!
//! # List the built-in data producers
//! fieldwork producers
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use fieldwork_core::{DiagnosticBag, DiagnosticSeverity};
use fieldwork_runtime::{
    Context, Entity, Executor, ExecutorConfig, MemoryEntityStorage, ProducerRegistry,
    QueryPlan, Response, SchemaConfig, Services,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fieldwork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check resolver configurations for errors
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
    },

    /// Execute a query plan
    Run {
        /// Resolver configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Query plan file
        #[arg(short = 'Q', long)]
        query: PathBuf,

        /// Entities to serve, as a JSON array
        #[arg(short, long)]
        entities: Option<PathBuf>,

        /// Number of executions sharing one cache
        #[arg(long, default_value = "1")]
        repeat: usize,

        /// Resolve without the field cache
        #[arg(long)]
        no_cache: bool,

        /// Request data as key=value; the value is JSON or a plain string
        #[arg(long = "context", value_parser = parse_context_arg)]
        context: Vec<(String, Value)>,
    },

    /// List the built-in data producers
    Producers,

    /// Print version information
    Version,
}

pub async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Check { files, strict } => check_files(&files, strict, cli.verbose),
        Commands::Run {
            config,
            query,
            entities,
            repeat,
            no_cache,
            context,
        } => {
            let request = context
                .into_iter()
                .fold(Context::new(), |request, (key, value)| request.with(key, value));
            run_plan(
                &config,
                &query,
                entities.as_deref(),
                repeat,
                !no_cache,
                request,
                cli.quiet,
            )
            .await
        }
        Commands::Producers => {
            list_producers();
            Ok(0)
        }
        Commands::Version => {
            println!("fieldwork {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Parses `key=value`, reading the value as JSON when it parses.
pub fn parse_context_arg(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", arg))?;
    if key.is_empty() {
        return Err(format!("missing key in '{}'", arg));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn builtin_registry(storage: MemoryEntityStorage) -> (ProducerRegistry, Arc<MemoryEntityStorage>) {
    let storage = Arc::new(storage);
    (ProducerRegistry::with_builtins(storage.clone()), storage)
}

fn check_files(files: &[PathBuf], strict: bool, verbose: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let mut has_errors = false;
    let (registry, _) = builtin_registry(MemoryEntityStorage::new());

    for file in files {
        if verbose {
            println!("{} {}", "Checking".blue(), file.display());
        }

        let config = SchemaConfig::from_json(&std::fs::read_to_string(file)?)?;
        let (resolvers, diagnostics) = config.build(&registry);
        let failed = diagnostics.has_errors() || (strict && !diagnostics.is_empty());

        if failed {
            has_errors = true;
            eprintln!("{} {}", "Error".red().bold(), file.display());
        } else if verbose {
            println!("{} {} ({} resolvers)", "OK".green(), file.display(), resolvers.len());
        }
        print_diagnostics(&diagnostics);
    }

    if has_errors {
        Ok(1)
    } else {
        println!("{} {} file(s) checked", "Success:".green().bold(), files.len());
        Ok(0)
    }
}

fn print_diagnostics(diagnostics: &DiagnosticBag) {
    for diagnostic in diagnostics.iter() {
        let level = match diagnostic.severity {
            DiagnosticSeverity::Error => format!("error[{}]", diagnostic.code).red().bold(),
            DiagnosticSeverity::Warning => format!("warning[{}]", diagnostic.code).yellow().bold(),
        };
        eprintln!("  {} {}", level, diagnostic.title);
        for label in &diagnostic.labels {
            eprintln!("    {} {}: {}", "-->".blue(), label.location, label.message);
        }
    }
}

/// The result of executing a plan one or more times.
#[derive(Debug)]
pub struct RunOutcome {
    pub responses: Vec<Response>,
    /// Bulk loads issued against entity storage.
    pub storage_loads: usize,
}

/// Executes `plan` `repeat` times against one cache and entity storage.
pub async fn execute(
    config: &SchemaConfig,
    entities: Vec<Entity>,
    plan: &QueryPlan,
    request: Context,
    repeat: usize,
    caching: bool,
) -> Result<RunOutcome, DiagnosticBag> {
    let (registry, storage) = builtin_registry(MemoryEntityStorage::from_entities(entities));
    let (resolvers, diagnostics) = config.build(&registry);
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let executor = Executor::new(resolvers, Services::new(registry)).with_config(ExecutorConfig {
        caching: caching && config.caching,
        ..config.executor_config()
    });

    let mut responses = Vec::with_capacity(repeat);
    for _ in 0..repeat {
        responses.push(executor.execute(plan, request.clone()).await);
    }

    Ok(RunOutcome {
        responses,
        storage_loads: storage.load_calls().len(),
    })
}

async fn run_plan(
    config: &Path,
    query: &Path,
    entities: Option<&Path>,
    repeat: usize,
    caching: bool,
    request: Context,
    quiet: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let config = SchemaConfig::from_json(&std::fs::read_to_string(config)?)?;
    let plan = QueryPlan::from_json(&std::fs::read_to_string(query)?)?;
    let entities: Vec<Entity> = match entities {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    let outcome = match execute(&config, entities, &plan, request, repeat.max(1), caching).await {
        Ok(outcome) => outcome,
        Err(diagnostics) => {
            eprintln!("{} invalid resolver configuration", "Error:".red().bold());
            print_diagnostics(&diagnostics);
            return Ok(1);
        }
    };

    let mut has_errors = false;
    for (i, response) in outcome.responses.iter().enumerate() {
        has_errors |= response.has_errors();
        info!(
            run = i + 1,
            errors = response.errors.as_ref().map_or(0, Vec::len),
            "executed query plan"
        );
        println!("{}", serde_json::to_string_pretty(response)?);

        if !quiet {
            let metadata = &response.metadata;
            eprintln!(
                "{} max-age {}, tags [{}], contexts [{}]",
                "Cacheability:".cyan(),
                metadata.max_age,
                metadata.tags.iter().cloned().collect::<Vec<_>>().join(", "),
                metadata.contexts.iter().cloned().collect::<Vec<_>>().join(", "),
            );
        }
    }

    if !quiet {
        eprintln!("{} {}", "Storage loads:".cyan(), outcome.storage_loads);
    }

    Ok(if has_errors { 1 } else { 0 })
}

fn list_producers() {
    let (registry, _) = builtin_registry(MemoryEntityStorage::new());
    for definition in registry.definitions() {
        let cacheable = if definition.cacheable {
            "cacheable".green()
        } else {
            "uncached".dimmed()
        };
        println!("{} {} ({})", definition.id.bold(), definition.label, cacheable);
        for (slot, slot_definition) in &definition.consumes {
            let required = if slot_definition.required { "required" } else { "optional" };
            let kind = if slot_definition.multiple {
                format!("[{}]", slot_definition.kind)
            } else {
                slot_definition.kind.to_string()
            };
            println!("    {}: {} ({})", slot, kind, required);
        }
    }
}
