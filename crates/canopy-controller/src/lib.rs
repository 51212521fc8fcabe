//! The canopy controller: per-state-URI transaction DAG and mempool.
//!
//! A [`Controller`] owns one replicated document: it accepts candidate txs,
//! validates intrinsics (parents present and valid, signature recovers to
//! the sender), runs the behavior tree's validators and resolvers over a
//! writable state snapshot, commits, and maintains the DAG frontier
//! ([`Controller::leaves`]). Txs blocked on missing parents or refs stay in
//! the mempool; every arrival (and every downloaded ref) triggers passes
//! until a fixed point.
//!
//! The [`Hub`] multiplexes controllers across state URIs for the host.

pub mod controller;
pub mod error;
pub mod hub;
pub mod store;

pub use controller::{
    reconciling_handler, Controller, TxProcessedHandler, INDEXES_KEY, MERGE_TYPE_KEY,
    VALIDATOR_KEY,
};
pub use error::{ControllerError, ControllerResult};
pub use hub::Hub;
pub use store::{InMemoryTxStore, TxStore};
