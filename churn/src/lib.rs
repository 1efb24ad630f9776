mod client;
mod config;
mod doc_id;
mod error;
mod liveness;
mod verify;
mod workload;
mod writer;

pub mod scenario;
pub mod sim;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use client::*;
pub use config::*;
pub use doc_id::DocId;
pub use error::*;
pub use liveness::LivenessWaiter;
pub use verify::{ConvergenceVerifier, CountRound};
pub use workload::{WorkloadGenerator, WorkloadOptions};
pub use writer::WriteTask;
