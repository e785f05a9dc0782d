use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use jacs_core::config::DispatcherConfig;
use jacs_core::execution::TokioProcessExecutor;
use jacs_core::logging::init_tracing;
use jacs_core::models::{
    CoreError, CoreErrorKind, CoreResult, DEFAULT_PAGE_SIZE, ServiceId, ServiceRecord,
    ServiceState,
};
use jacs_core::orchestration::{ServiceDispatcher, prepare_submission};
use jacs_core::persistence::{ServiceStore, find_all_by_state, run_blocking};
use jacs_core::registry::ServiceRegistry;
use jacs_core::services::register_builtin_services;
use jacs_core::sqlite::SqliteStore;

/// Asynchronous service dispatcher
#[derive(Parser)]
#[command(name = "jacsd", version)]
struct Cli {
    /// SQLite database holding service records
    #[arg(long, env = "JACS_DATABASE_PATH", default_value = "jacs.sqlite3", global = true)]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until interrupted
    Serve,

    /// Queue a service for a running server to pick up on its next sync
    Submit {
        /// Registered service name
        name: String,

        /// Parameters as key=value; values are parsed as JSON when possible
        #[arg(value_parser = parse_parameter)]
        parameters: Vec<(String, Value)>,
    },

    /// Print a service record
    Show {
        id: u64,

        /// Include every descendant of the service
        #[arg(long)]
        hierarchy: bool,
    },

    /// List services in the given comma-separated states
    List {
        states: String,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
    },

    /// List the built-in services and their arguments
    Services,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("info");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("jacsd: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CoreResult<()> {
    let sqlite = SqliteStore::new(&cli.database);
    sqlite.migrate_to_latest()?;
    let store: Arc<dyn ServiceStore> = Arc::new(sqlite);

    match cli.command {
        Command::Serve => serve(store, cli.database).await,
        Command::Submit { name, parameters } => {
            let record = ServiceRecord::new(name).parameters(parameters.into_iter().collect());
            let record = prepare_submission(record, None)?;
            let saved = run_blocking(&store, "save", move |store| store.save(&record)).await?;
            print_json(&saved)
        }
        Command::Show { id, hierarchy } => {
            let id = ServiceId(id);
            if hierarchy {
                let records = run_blocking(&store, "find_service_hierarchy", move |store| {
                    store.find_service_hierarchy(id)
                })
                .await?;
                print_json(&records)
            } else {
                let record = run_blocking(&store, "find_by_id", move |store| store.find_by_id(id))
                    .await?
                    .ok_or_else(|| {
                        CoreError::new(CoreErrorKind::InvalidInput, format!("no service '{id}'"))
                    })?;
                print_json(&record)
            }
        }
        Command::List { states, page_size } => {
            let states = states
                .split(',')
                .map(str::parse::<ServiceState>)
                .collect::<CoreResult<Vec<_>>>()?;
            let records = run_blocking(&store, "find_by_state", move |store| {
                find_all_by_state(store, &states, page_size)
            })
            .await?;
            print_json(&records)
        }
        Command::Services => {
            let registry = builtin_registry();
            let metadata: Vec<_> = registry
                .service_names()
                .into_iter()
                .filter_map(|name| registry.lookup(name).ok())
                .map(|descriptor| descriptor.metadata().clone())
                .collect();
            print_json(&metadata)
        }
    }
}

async fn serve(store: Arc<dyn ServiceStore>, database: PathBuf) -> CoreResult<()> {
    let config = DispatcherConfig::from_env()?;
    let dispatcher = ServiceDispatcher::new(Arc::new(builtin_registry()), store, config);

    let recovered = dispatcher.sync_service_queue().await?;
    tracing::info!(
        database = %database.display(),
        recovered,
        "jacsd serving"
    );

    dispatcher
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for ctrl-c");
            }
        })
        .await;
    Ok(())
}

fn builtin_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    register_builtin_services(&mut registry, Arc::new(TokioProcessExecutor));
    registry
}

fn parse_parameter(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("parameter name is empty in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> CoreResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to encode output: {error}"),
        )
    })?;
    println!("{text}");
    Ok(())
}
