//! shellcache - versioned HTTP response cache
//!
//! Installs the configured version into the cache store and serves requests
//! through the gateway from the command line.

use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error};

use shellcache::cache::{CacheStore, GenerationHandle, GenerationMarker};
use shellcache::cli::{Cli, Command, RequestArgs};
use shellcache::config::Config;
use shellcache::control::{ControlCommand, ControlHandle};
use shellcache::gateway::Gateway;
use shellcache::lifecycle::{DurableState, LifecycleController};
use shellcache::telemetry;
use shellcache::transport::HttpTransport;

/// Exit code for a network failure no strategy could absorb
const EXIT_NETWORK: u8 = 2;

fn load_config(cli: &Cli) -> Result<Config, Box<dyn Error>> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path().ok_or("cannot determine the configuration directory")?,
    };
    debug!(path = %path.display(), "loading configuration");
    Ok(Config::load(&path)?)
}

fn open_store(cli: &Cli, config: Option<&Config>) -> Result<CacheStore, Box<dyn Error>> {
    let dir = cli
        .cache_dir
        .clone()
        .or_else(|| config.and_then(|c| c.store.dir.clone()));
    let store = match dir {
        Some(dir) => CacheStore::with_dir(dir),
        None => CacheStore::new().ok_or("cannot determine the cache directory")?,
    };
    debug!(root = %store.root().display(), "opened cache store");
    Ok(store)
}

fn build_gateway(cli: &Cli, config: &Config) -> Result<Gateway, Box<dyn Error>> {
    let store = Arc::new(open_store(cli, Some(config))?);
    let transport = Arc::new(HttpTransport::new(config.transport.timeout())?);
    let lifecycle = Arc::new(LifecycleController::new(store, config.manifest()?));
    lifecycle.resume()?;
    Ok(Gateway::new(
        lifecycle,
        config.routing_table(),
        config.admission_filter(),
        transport,
    ))
}

fn label_or_none(handle: Option<GenerationHandle>) -> String {
    handle.map_or_else(|| "none".to_string(), |h| h.label().to_string())
}

async fn install(cli: &Cli, defer: bool) -> Result<ExitCode, Box<dyn Error>> {
    let config = load_config(cli)?;
    let gateway = build_gateway(cli, &config)?;

    let handle = gateway.on_install(&config.version).await?;
    if !defer {
        gateway.on_activate();
    }

    let lifecycle = gateway.lifecycle();
    let mut summary = format!(
        "installed {} ({} entries); active: {}",
        handle.label(),
        lifecycle.manifest().entries().len(),
        label_or_none(lifecycle.active())
    );
    if let Some(waiting) = lifecycle.waiting() {
        summary.push_str(&format!("; waiting: {}", waiting.label()));
    }
    println!("{}", summary);
    Ok(ExitCode::SUCCESS)
}

async fn get(cli: &Cli, args: &RequestArgs) -> Result<ExitCode, Box<dyn Error>> {
    let config = load_config(cli)?;
    let gateway = build_gateway(cli, &config)?;
    let request = args.to_request()?;

    let result = gateway.handle(&request).await;
    // Stale-while-revalidate refreshes must reach the store before the process exits
    gateway.drain().await;

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(url = %request.url, error = %e, "request failed");
            eprintln!("Error: {}", e);
            return Ok(ExitCode::from(EXIT_NETWORK));
        }
    };

    eprintln!("{}", response.status);
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;

    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn classify(cli: &Cli, args: &RequestArgs) -> Result<ExitCode, Box<dyn Error>> {
    let config = load_config(cli)?;
    let gateway = build_gateway(cli, &config)?;
    let request = args.to_request()?;
    println!("{}", gateway.route(&request).as_str());
    Ok(ExitCode::SUCCESS)
}

fn names(marker: &Option<GenerationMarker>, label: &str) -> bool {
    marker.as_ref().is_some_and(|marker| marker.label == label)
}

fn generations(cli: &Cli) -> Result<ExitCode, Box<dyn Error>> {
    // The store directory alone is enough when given on the command line
    let config = match cli.cache_dir {
        Some(_) => None,
        None => Some(load_config(cli)?),
    };
    let store = open_store(cli, config.as_ref())?;

    let durable = DurableState::read(&store)?;

    for label in store.list_generations()? {
        let Some(marker) = store.installed_marker(&label) else {
            println!("  {}\tincomplete", label);
            continue;
        };
        let (current, status) = if names(&durable.active, &label) {
            ("*", "active")
        } else if names(&durable.waiting, &label) {
            (" ", "waiting")
        } else {
            (" ", "installed")
        };
        println!(
            "{} {}\t{}\t{}",
            current,
            label,
            status,
            marker.installed_at.to_rfc3339()
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn control(cli: &Cli, command: ControlCommand) -> Result<ExitCode, Box<dyn Error>> {
    let config = load_config(cli)?;
    let gateway = build_gateway(cli, &config)?;

    let handle = ControlHandle::spawn(Arc::clone(gateway.lifecycle()));
    handle.send(command);
    handle.shutdown().await;

    let lifecycle = gateway.lifecycle();
    println!(
        "{}: done; active: {}",
        command,
        label_or_none(lifecycle.active())
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: &Cli) -> Result<ExitCode, Box<dyn Error>> {
    match &cli.command {
        Command::Install { defer } => install(cli, *defer).await,
        Command::Get(args) => get(cli, args).await,
        Command::Classify(args) => classify(cli, args),
        Command::Generations => generations(cli),
        Command::Control { command } => control(cli, *command).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(&cli.log_level) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
