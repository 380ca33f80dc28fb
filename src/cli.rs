// src/cli.rs
// =============================================================================
// This file defines our command-line interface using the `clap` crate.
//
// We use the "derive" API: the CLI structure is described with Rust structs
// and enums, and clap generates the parsing, --help and --version for us.
//
// Subcommands:
// - harvest:  walk a code range of one service and record every redirect
// - services: list the services we know about
// - probe:    check which services are reachable and not blocking us
// - check:    compare a service adapter against a fixture file
// - dedupe, repair, csv: clean up and convert harvest output (stdin -> stdout)
// =============================================================================

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "shorturl-reaper",
    version = "0.1.0",
    about = "A CLI tool to harvest the code -> URL tables of URL shorteners",
    long_about = "shorturl-reaper walks a range of short codes of a URL shortener, asks the \
                  service where each code points, and writes every hit as a `code|url` line."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest a range of codes from one service
    ///
    /// Example: shorturl-reaper harvest isgd a zz --threads 20
    Harvest(HarvestArgs),

    /// List the supported services
    Services {
        /// Output in JSON format instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Fetch one code from each service to see if it works for us
    ///
    /// Example: shorturl-reaper probe tinyurl trim
    Probe {
        /// Services to probe (default: all of them)
        services: Vec<String>,

        /// Seconds before a probe gives up
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Output in JSON format instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check a service against a fixture file of known codes
    ///
    /// Fixture lines look like `code|url`, `code|notfound` or `code|blocked`.
    Check {
        /// Service name (see `services`)
        service: String,

        /// Path to the fixture file
        fixtures: PathBuf,

        /// Seconds before a single fetch gives up
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Output in JSON format instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Drop repeated records (stdin -> stdout)
    Dedupe,

    /// Strip zero padding and drop unusable records (stdin -> stdout)
    Repair,

    /// Convert records to `url,code,,` CSV rows (stdin -> stdout)
    Csv {
        /// Text prepended to every code, e.g. http://is.gd/
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

/// Arguments of the `harvest` subcommand.
#[derive(Args, Debug)]
pub struct HarvestArgs {
    /// Service name (see `services`)
    pub service: String,

    /// First code of the range
    pub start: String,

    /// Last code of the range (inclusive)
    pub stop: String,

    /// Number of fetch workers
    #[arg(long, default_value_t = 10)]
    pub threads: usize,

    /// Refill the queue when fewer than this many codes per worker are left
    #[arg(long, default_value_t = 2)]
    pub min_per_thread: usize,

    /// Fill the queue up to this many codes per worker
    #[arg(long, default_value_t = 10)]
    pub max_per_thread: usize,

    /// Seconds before a single fetch gives up
    #[arg(long, default_value_t = 10)]
    pub fetch_timeout: u64,

    /// Seconds between stats reports (and block rate checks)
    #[arg(long, default_value_t = 120)]
    pub monitor_interval: u64,

    /// Abort when this fraction of requests in one interval was blocked
    #[arg(long, default_value_t = 0.1)]
    pub block_threshold: f64,

    /// Where the .txt and .log files go
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Log debug messages too
    #[arg(long)]
    pub debug: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

// -----------------------------------------------------------------------------
// BEGINNER NOTES:
//
// 1. Why is HarvestArgs a separate struct?
//    - `harvest` has many flags; #[derive(Args)] lets us keep them in their
//      own struct and pass the whole thing around
//
// 2. What does default_value_t do?
//    - It gives a typed default (usize, u64, f64, ...) that clap also shows
//      in --help
//    - default_value (without _t) takes the default as a string instead
// -----------------------------------------------------------------------------
