//! distributed shot execution support for quantum circuit runs.
//!
//! the crate splits a shot budget across processes, moves each process's
//! measured results to the supervisor (rank 0) and recombines them there:
//!
//! - [`codec`]: flat u32/f64 wire encodings for results maps and gradients
//! - [`transport`]: tagged point-to-point substrates (in-process, tcp, mpi)
//! - [`manager`]: typed send/receive with timeouts on top of a transport
//! - [`partition`]: shot quotas and shot-weighted aggregation
//! - [`distribute`]: end-to-end driver used by the `qb-shots` binary

pub mod codec; // wire encodings
pub mod config; // run configuration
pub mod distribute; // run driver
pub mod error;
pub mod manager; // typed messaging
pub mod partition; // quotas and aggregation
pub mod results; // results map types
pub mod sampler; // synthetic workload
pub mod transport; // message substrates

pub use config::DistributedConfig;
pub use error::{Error, Result};
pub use manager::MpiManager;

#[cfg(test)] // for testing
mod test;
