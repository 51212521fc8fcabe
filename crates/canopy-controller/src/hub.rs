use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use canopy_behavior::PluginRegistry;
use canopy_state::MemoryNode;
use canopy_tx::Tx;
use canopy_types::{Keypath, Range, TxId, Version};

use crate::controller::{Controller, TxProcessedHandler};
use crate::error::ControllerResult;
use crate::store::TxStore;

/// Multiplexes controllers by state URI, creating them on demand.
///
/// The hub is the host's single handle onto every replicated document: txs
/// route by their state URI, and the ref-download signal fans out to every
/// controller so any tx blocked on that ref gets another chance.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    tx_store: Arc<dyn TxStore>,
    registry: Arc<PluginRegistry>,
    on_tx_processed: TxProcessedHandler,
    controllers: RwLock<HashMap<String, Controller>>,
}

impl Hub {
    pub fn new(
        tx_store: Arc<dyn TxStore>,
        registry: Arc<PluginRegistry>,
        on_tx_processed: TxProcessedHandler,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                tx_store,
                registry,
                on_tx_processed,
                controllers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The controller for a state URI, created (and started) on first use.
    pub fn ensure_controller(&self, state_uri: &str) -> Controller {
        if let Some(controller) = self
            .inner
            .controllers
            .read()
            .expect("hub lock poisoned")
            .get(state_uri)
        {
            return controller.clone();
        }

        let mut controllers = self.inner.controllers.write().expect("hub lock poisoned");
        controllers
            .entry(state_uri.to_string())
            .or_insert_with(|| {
                debug!(state_uri, "creating controller");
                let controller = Controller::new(
                    state_uri,
                    Arc::clone(&self.inner.tx_store),
                    Arc::clone(&self.inner.registry),
                    Arc::clone(&self.inner.on_tx_processed),
                );
                controller.start();
                controller
            })
            .clone()
    }

    pub fn controller(&self, state_uri: &str) -> Option<Controller> {
        self.inner
            .controllers
            .read()
            .expect("hub lock poisoned")
            .get(state_uri)
            .cloned()
    }

    pub fn add_tx(&self, tx: &Tx) -> ControllerResult<()> {
        self.ensure_controller(&tx.state_uri).add_tx(tx)
    }

    pub fn have_tx(&self, state_uri: &str, id: &TxId) -> bool {
        self.controller(state_uri)
            .map(|c| c.have_tx(id))
            .unwrap_or(false)
    }

    pub fn state_at_version(
        &self,
        state_uri: &str,
        version: Option<&Version>,
    ) -> ControllerResult<MemoryNode> {
        self.ensure_controller(state_uri).state_at_version(version)
    }

    pub fn query_index(
        &self,
        state_uri: &str,
        version: Option<&Version>,
        keypath: &Keypath,
        index_name: &str,
        query_param: &Keypath,
        rng: Option<Range>,
    ) -> ControllerResult<MemoryNode> {
        self.ensure_controller(state_uri)
            .query_index(version, keypath, index_name, query_param, rng)
    }

    pub fn fetch_txs(&self, state_uri: &str) -> ControllerResult<Vec<Tx>> {
        self.ensure_controller(state_uri).fetch_txs()
    }

    /// Fan the ref-download signal out to every controller.
    pub fn on_downloaded_ref(&self) {
        for controller in self
            .inner
            .controllers
            .read()
            .expect("hub lock poisoned")
            .values()
        {
            controller.on_downloaded_ref();
        }
    }
}
