//! Transactions and patches: the unit of replication in canopy.
//!
//! A [`Tx`] is a signed change-set naming its causal parents; its payload is
//! an ordered list of [`Patch`]es (`keypath [range] = value`). Txs form a
//! per-state-URI DAG and are folded into the state tree by the controller.

pub mod error;
pub mod patch;
pub mod tx;

pub use error::{TxError, TxResult};
pub use patch::{canonical_keypath_string, parse_patch, Patch};
pub use tx::{private_root_key_for_recipients, Tx};
