//! portlock CLI - file-based locks and port allocation across processes.

mod atomic;
mod cli;
mod display;
mod error;
mod lock_file;
mod model;
mod path_guard;
mod probe;
mod process;
mod registry;
mod semaphore;
mod store;

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, LockCommand, PortCommand, RegistryOpts};
use display::{
    display_entries, display_entries_json, display_lock_status, display_lock_status_json,
    display_registry_status, display_registry_status_json, entry_json, lock_record_json,
};
use error::Result;
use registry::{PortRegistry, RegistryConfig};
use semaphore::Semaphore;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let json = cli.json;
    if let Err(e) = run(cli) {
        if json {
            println!("{}", e.to_json());
        } else {
            eprintln!("Error: {e}");
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Lock(command) => match command {
            LockCommand::Try { path, tag } => cmd_lock_try(&path, tag.as_deref(), cli.json),
            LockCommand::Acquire { path, timeout, tag } => {
                cmd_lock_acquire(&path, timeout, tag.as_deref(), cli.json)
            }
            LockCommand::Release { path, force } => cmd_lock_release(&path, force, cli.json),
            LockCommand::Status { path } => cmd_lock_status(&path, cli.json),
            LockCommand::Clean { path } => cmd_lock_clean(&path, cli.json),
        },
        Command::Port(command) => match command {
            PortCommand::Get { count, tag, opts } => {
                cmd_port_get(count, tag.as_deref(), &opts, cli.json)
            }
            PortCommand::Release { port, opts } => cmd_port_release(port, &opts, cli.json),
            PortCommand::ReleaseAll { opts } => cmd_port_release_all(&opts, cli.json),
            PortCommand::List { opts } => cmd_port_list(&opts, cli.json),
            PortCommand::Clean { opts } => cmd_port_clean(&opts, cli.json),
            PortCommand::Status { opts } => cmd_port_status(&opts, cli.json),
            PortCommand::Clear { opts } => cmd_port_clear(&opts, cli.json),
        },
    }
}

fn cmd_lock_try(path: &Path, tag: Option<&str>, json: bool) -> Result<()> {
    let sem = Semaphore::with_defaults(path)?;
    let record = sem.try_acquire(tag)?;

    if json {
        let mut value = lock_record_json(&record);
        value["status"] = json!("ok");
        println!("{value}");
    } else {
        println!("Acquired {} (PID {})", sem.path().display(), record.pid);
    }
    Ok(())
}

fn cmd_lock_acquire(path: &Path, timeout_ms: u64, tag: Option<&str>, json: bool) -> Result<()> {
    let sem = Semaphore::with_defaults(path)?;
    let record = sem.acquire(Duration::from_millis(timeout_ms), tag)?;

    if json {
        let mut value = lock_record_json(&record);
        value["status"] = json!("ok");
        println!("{value}");
    } else {
        println!("Acquired {} (PID {})", sem.path().display(), record.pid);
    }
    Ok(())
}

fn cmd_lock_release(path: &Path, force: bool, json: bool) -> Result<()> {
    let sem = Semaphore::with_defaults(path)?;
    sem.release(force)?;

    if json {
        println!("{}", json!({ "status": "ok" }));
    } else {
        println!("Released {}", sem.path().display());
    }
    Ok(())
}

fn cmd_lock_status(path: &Path, json: bool) -> Result<()> {
    let sem = Semaphore::with_defaults(path)?;
    let status = sem.status();

    if json {
        display_lock_status_json(&status);
    } else {
        display_lock_status(&status);
    }
    Ok(())
}

fn cmd_lock_clean(path: &Path, json: bool) -> Result<()> {
    let sem = Semaphore::with_defaults(path)?;
    let removed = sem.clean_stale()?;

    if json {
        println!("{}", json!({ "status": "ok", "removed": removed }));
    } else if removed {
        println!("Removed stale lock state for {}", sem.path().display());
    } else {
        println!("Nothing to clean.");
    }
    Ok(())
}

/// Builds a registry configuration from the shared CLI flags.
fn build_registry(opts: &RegistryOpts) -> PortRegistry {
    let mut config = RegistryConfig::default();
    if let Some(min) = opts.min_port {
        config.min_port = min;
    }
    if let Some(max) = opts.max_port {
        config.max_port = max;
    }
    config.allow_privileged = opts.allow_privileged;
    if let Some(ref dir) = opts.registry_dir {
        config.registry_dir = dir.clone();
    }
    PortRegistry::new(config)
}

fn cmd_port_get(count: usize, tag: Option<&str>, opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    let allocated = registry.get_multiple(count, tag)?;

    if json {
        let ports: Vec<_> = allocated.iter().map(entry_json).collect();
        println!("{}", json!({ "status": "ok", "ports": ports }));
    } else {
        for entry in &allocated {
            println!("{}", entry.port);
        }
    }
    Ok(())
}

fn cmd_port_release(port: model::Port, opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    registry.release(port)?;

    if json {
        println!("{}", json!({ "status": "ok", "port": port.as_u16() }));
    } else {
        println!("Released port {port}");
    }
    Ok(())
}

fn cmd_port_release_all(opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    let released = registry.release_all()?;

    if json {
        println!("{}", json!({ "status": "ok", "released": released }));
    } else {
        println!("Released {released} port(s)");
    }
    Ok(())
}

fn cmd_port_list(opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    let entries = registry.list()?;

    if json {
        display_entries_json(&entries);
    } else {
        display_entries(
            &entries,
            registry.config().stale_timeout.as_millis() as u64,
        );
    }
    Ok(())
}

fn cmd_port_clean(opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    let removed = registry.clean()?;

    if json {
        println!("{}", json!({ "status": "ok", "removed": removed }));
    } else {
        println!("Removed {removed} stale entr{}", if removed == 1 { "y" } else { "ies" });
    }
    Ok(())
}

fn cmd_port_status(opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    let status = registry.status()?;

    if json {
        display_registry_status_json(&status);
    } else {
        display_registry_status(&status);
    }
    Ok(())
}

fn cmd_port_clear(opts: &RegistryOpts, json: bool) -> Result<()> {
    let registry = build_registry(opts);
    registry.clear()?;

    if json {
        println!("{}", json!({ "status": "ok" }));
    } else {
        println!("Registry cleared");
    }
    Ok(())
}
