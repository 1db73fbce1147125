//! Ramp daemon library.
//!
//! The daemon migrates individual features from their legacy data source to
//! a real backend incrementally, by user percentage, while continuously
//! watching health signals and rolling a feature back to 0% the moment
//! quality thresholds are breached.
//!
//! Data flow: [`sampler`] feeds per-variant sliding windows, [`evaluator`]
//! classifies them into verdicts, [`controller`] turns verdicts and operator
//! commands into state transitions against [`store`], [`router`] serves the
//! hot routing path from an eventually-consistent snapshot, and [`audit`]
//! plus [`notify`] record and broadcast every transition.

pub mod audit;
pub mod controller;
pub mod evaluator;
pub mod events;
pub mod http_api;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod router;
pub mod sampler;
pub mod store;
