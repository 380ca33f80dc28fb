// src/checker/mod.rs
// =============================================================================
// This module checks that the service adapters still work.
//
// Submodules:
// - probe: one quick fetch per service, to see who is blocking us
// - fixtures: compares an adapter against a file of known codes
//
// Neither writes any output file; results are printed by main.rs.
// =============================================================================

mod fixtures;
mod probe;

pub use fixtures::{check_fixtures, parse_fixtures};
pub use probe::{probe_services, ProbeResult, ProbeStatus};
