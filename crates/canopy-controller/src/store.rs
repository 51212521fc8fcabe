use std::collections::HashMap;
use std::sync::RwLock;

use canopy_tx::Tx;
use canopy_types::TxId;

use crate::error::{ControllerError, ControllerResult};

/// Storage boundary for transactions, keyed by `(state URI, tx ID)`.
///
/// Txs are written unvalidated on arrival and rewritten with `valid = true`
/// once applied; they are never removed.
pub trait TxStore: Send + Sync {
    /// Insert or overwrite a tx.
    fn add_tx(&self, tx: &Tx) -> ControllerResult<()>;

    /// Fetch a tx; [`ControllerError::NotFound`] when absent.
    fn fetch_tx(&self, state_uri: &str, id: &TxId) -> ControllerResult<Tx>;

    fn tx_exists(&self, state_uri: &str, id: &TxId) -> ControllerResult<bool>;

    /// All txs for a state URI, in unspecified order.
    fn all_txs(&self, state_uri: &str) -> ControllerResult<Vec<Tx>>;
}

/// HashMap-backed tx store for tests and embedding.
#[derive(Default)]
pub struct InMemoryTxStore {
    txs: RwLock<HashMap<(String, TxId), Tx>>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TxStore for InMemoryTxStore {
    fn add_tx(&self, tx: &Tx) -> ControllerResult<()> {
        self.txs
            .write()
            .expect("tx store lock poisoned")
            .insert((tx.state_uri.clone(), tx.id), tx.clone());
        Ok(())
    }

    fn fetch_tx(&self, state_uri: &str, id: &TxId) -> ControllerResult<Tx> {
        self.txs
            .read()
            .expect("tx store lock poisoned")
            .get(&(state_uri.to_string(), *id))
            .cloned()
            .ok_or(ControllerError::NotFound)
    }

    fn tx_exists(&self, state_uri: &str, id: &TxId) -> ControllerResult<bool> {
        Ok(self
            .txs
            .read()
            .expect("tx store lock poisoned")
            .contains_key(&(state_uri.to_string(), *id)))
    }

    fn all_txs(&self, state_uri: &str) -> ControllerResult<Vec<Tx>> {
        Ok(self
            .txs
            .read()
            .expect("tx store lock poisoned")
            .values()
            .filter(|tx| tx.state_uri == state_uri)
            .cloned()
            .collect())
    }
}
