// src/main.rs
// =============================================================================
// This is the entry point of our CLI application.
//
// What happens here:
// 1. Parse command-line arguments using clap
// 2. Set up logging (harvests also log to a file next to their output)
// 3. Dispatch to the appropriate subcommand handler
// 4. Print results as a table or JSON
// 5. Exit with proper code (0 = success, 1 = run aborted / check failed,
//    2 = internal or usage error)
// =============================================================================

mod checker; // src/checker/ - probing and fixture checks
mod cli; // src/cli.rs - command-line parsing
mod error; // src/error.rs - run-fatal errors
mod harvest; // src/harvest/ - the sequencer / worker / writer pipeline
mod logging; // src/logging.rs - tracing setup
mod postprocess; // src/postprocess/ - stdin -> stdout filters
mod services; // src/services/ - one adapter per URL shortener

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use cli::{Cli, Commands, HarvestArgs};
use error::HarvestError;
use harvest::{HarvestConfig, HarvestSummary, Harvester};
use services::{Endpoint, ServiceDescriptor};

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // {:#} prints the whole context chain on one line
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

// Returns the exit code; Err means something went wrong outside a run
async fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest(args) => handle_harvest(args).await,
        Commands::Services { json } => {
            let _guard = logging::init(false, None)?;
            handle_services(json)
        }
        Commands::Probe {
            services,
            timeout,
            json,
        } => {
            let _guard = logging::init(false, None)?;
            handle_probe(&services, Duration::from_secs(timeout), json).await
        }
        Commands::Check {
            service,
            fixtures,
            timeout,
            json,
        } => {
            let _guard = logging::init(false, None)?;
            handle_check(&service, &fixtures, Duration::from_secs(timeout), json).await
        }
        Commands::Dedupe => {
            let _guard = logging::init(false, None)?;
            let dropped = postprocess::dedupe(std::io::stdin().lock(), stdout())?;
            info!("Dropped {} duplicate records", dropped);
            Ok(0)
        }
        Commands::Repair => {
            let _guard = logging::init(false, None)?;
            let dropped = postprocess::repair(std::io::stdin().lock(), stdout())?;
            info!("Dropped {} unusable records", dropped);
            Ok(0)
        }
        Commands::Csv { prefix } => {
            let _guard = logging::init(false, None)?;
            postprocess::to_csv(std::io::stdin().lock(), stdout(), &prefix)?;
            Ok(0)
        }
    }
}

fn stdout() -> BufWriter<std::io::StdoutLock<'static>> {
    BufWriter::new(std::io::stdout().lock())
}

fn find_service(name: &str) -> Result<&'static ServiceDescriptor> {
    services::lookup(name).ok_or_else(|| {
        let known: Vec<&str> = services::registry().iter().map(|d| d.name).collect();
        anyhow!("Unknown service {:?} (known: {})", name, known.join(", "))
    })
}

// Output files are named after the service and the range,
// e.g. TinyURL_a-zzz.txt and TinyURL_a-zzz.log
fn output_file(dir: &Path, descriptor: &ServiceDescriptor, start: &str, stop: &str, extension: &str) -> PathBuf {
    dir.join(format!("{}_{}-{}.{}", descriptor.display_name, start, stop, extension))
}

// Handles the 'harvest' subcommand
async fn handle_harvest(args: HarvestArgs) -> Result<i32> {
    let descriptor = find_service(&args.service)?;
    let start = (descriptor.canonicalize)(&args.start)
        .with_context(|| format!("Invalid start code {:?}", args.start))?;
    let stop = (descriptor.canonicalize)(&args.stop)
        .with_context(|| format!("Invalid stop code {:?}", args.stop))?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let log_path = output_file(&args.output_dir, descriptor, &start, &stop, "log");
    let _guard = logging::init(args.debug, Some(log_path.as_path()))?;

    let config = HarvestConfig {
        threads: args.threads,
        min_per_thread: args.min_per_thread,
        max_per_thread: args.max_per_thread,
        fetch_timeout: Duration::from_secs(args.fetch_timeout),
        monitor_interval: Duration::from_secs(args.monitor_interval),
        block_threshold: args.block_threshold,
        ..HarvestConfig::default()
    };

    let target = descriptor
        .default_target()
        .with_context(|| format!("Failed to set up {}", descriptor.name))?;
    let harvester = Harvester::new(config, descriptor.code_space, descriptor.factory(target));

    let output_path = output_file(&args.output_dir, descriptor, &start, &stop, "txt");
    let output = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&output_path)
        .await
        .with_context(|| format!("Failed to open {}", output_path.display()))?;
    info!("Writing records to {}", output_path.display());

    match harvester.run(&start, &stop, output).await {
        Ok(summary) => {
            print_summary(descriptor, &summary, args.json)?;
            Ok(0)
        }
        Err(e @ (HarvestError::InvalidRange { .. } | HarvestError::Config(_))) => Err(e.into()),
        Err(e) => {
            error!("Harvest aborted: {}", e);
            eprintln!("Harvest aborted: {}", e);
            Ok(1)
        }
    }
}

fn print_summary(descriptor: &ServiceDescriptor, summary: &HarvestSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("📊 {} {}..{}", descriptor.display_name, summary.start, summary.stop);
    println!("   ✅ Records written: {}", summary.records);
    println!("   🔎 Not found: {}", summary.stats.not_found);
    println!("   ⚠️  Errors: {}", summary.stats.errors);
    println!("   🚫 Blocked: {}", summary.stats.blocked);
    println!("   📋 Requests: {} in {:.1}s", summary.stats.fetched, summary.elapsed_secs);
    Ok(())
}

// One row of `services`
#[derive(Debug, Serialize)]
struct ServiceInfo {
    name: &'static str,
    display_name: &'static str,
    charset: &'static str,
    hosts: Vec<&'static str>,
    rotating: bool,
}

impl From<&ServiceDescriptor> for ServiceInfo {
    fn from(descriptor: &ServiceDescriptor) -> Self {
        let (hosts, rotating) = match descriptor.endpoint {
            Endpoint::Host(host) => (vec![host], false),
            Endpoint::Rotating(hosts) => (hosts.to_vec(), true),
        };
        Self {
            name: descriptor.name,
            display_name: descriptor.display_name,
            charset: descriptor.code_space.charset(),
            hosts,
            rotating,
        }
    }
}

// Handles the 'services' subcommand
fn handle_services(json: bool) -> Result<i32> {
    let infos: Vec<ServiceInfo> = services::registry().iter().map(ServiceInfo::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(0);
    }

    println!("{:<10} {:<10} {:<8} {}", "NAME", "FILES", "SYMBOLS", "HOSTS");
    println!("{}", "=".repeat(60));
    for info in &infos {
        let hosts = info.hosts.join(", ");
        let hosts = if info.rotating { format!("{} (rotating)", hosts) } else { hosts };
        println!("{:<10} {:<10} {:<8} {}", info.name, info.display_name, info.charset.len(), hosts);
    }
    Ok(0)
}

// Handles the 'probe' subcommand
async fn handle_probe(names: &[String], timeout: Duration, json: bool) -> Result<i32> {
    let descriptors: Vec<&ServiceDescriptor> = if names.is_empty() {
        services::registry().iter().collect()
    } else {
        names.iter().map(|name| find_service(name)).collect::<Result<_>>()?
    };

    let mut results = Vec::new();
    let mut instances = Vec::new();
    for descriptor in descriptors {
        match descriptor.default_target() {
            Ok(target) => instances.push((descriptor.name.to_string(), descriptor.build(target))),
            Err(e) => results.push(checker::ProbeResult::unavailable(descriptor.name, e.to_string())),
        }
    }
    results.extend(checker::probe_services(instances, timeout).await);
    results.sort_by(|a, b| a.service.cmp(&b.service));

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!("{:<10} {:<12} {}", "SERVICE", "STATUS", "MESSAGE");
        println!("{}", "=".repeat(60));
        for result in &results {
            let status = match result.status {
                checker::ProbeStatus::Ok => "✅ OK",
                checker::ProbeStatus::Blocked => "🚫 BLOCKED",
                checker::ProbeStatus::Error => "⚠️  ERROR",
            };
            println!("{:<10} {:<12} {}", result.service, status, result.message.as_deref().unwrap_or(""));
        }
    }

    Ok(if results.iter().all(|r| r.is_ok()) { 0 } else { 1 })
}

// Handles the 'check' subcommand
async fn handle_check(name: &str, path: &Path, timeout: Duration, json: bool) -> Result<i32> {
    let descriptor = find_service(name)?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let fixtures = checker::parse_fixtures(&text)
        .with_context(|| format!("Invalid fixture file {}", path.display()))?;

    info!("Testing {} against {} fixtures", descriptor.name, fixtures.len());
    let target = descriptor
        .default_target()
        .with_context(|| format!("Failed to set up {}", descriptor.name))?;
    let mut service = descriptor.build(target);
    let results = checker::check_fixtures(service.as_mut(), &fixtures, timeout).await;

    let failed = results.iter().filter(|r| !r.passed).count();
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        let mut out = stdout();
        for result in results.iter().filter(|r| !r.passed) {
            writeln!(out, "❌ {}: expected {}, got {}", result.short_url, result.expected, result.actual)?;
        }
        writeln!(out, "📋 {} of {} fixtures passed", results.len() - failed, results.len())?;
        out.flush()?;
    }

    Ok(if failed == 0 { 0 } else { 1 })
}
