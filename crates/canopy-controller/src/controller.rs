use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use canopy_behavior::{BehaviorTree, LastWriterResolver, PluginRegistry};
use canopy_crypto::recover_signing_pubkey;
use canopy_state::{IndexStore, MemoryNode, StateTree};
use canopy_tx::{Patch, Tx};
use canopy_types::{Keypath, Range, TxId, Version};

use crate::error::{ControllerError, ControllerResult};
use crate::store::TxStore;

/// Child key holding a subtree's resolver config.
pub const MERGE_TYPE_KEY: &str = "Merge-Type";
/// Child key holding a subtree's validator config.
pub const VALIDATOR_KEY: &str = "Validator";
/// Child key under which named indexer configs live.
pub const INDEXES_KEY: &str = "Indexes";

/// Hook invoked after a tx's patches have been applied to the working state
/// but before the state is committed. The host uses it to scan the diff for
/// ref links, gate on missing critical refs, and reconcile the behavior
/// tree.
pub type TxProcessedHandler =
    Arc<dyn Fn(&Controller, &Tx, &mut MemoryNode) -> ControllerResult<()> + Send + Sync>;

/// A handler that only reconciles the behavior tree; the default when no
/// host is involved.
pub fn reconciling_handler() -> TxProcessedHandler {
    Arc::new(|controller, _tx, state| controller.reconcile_behavior_tree(state))
}

/// Owns one state URI: the tx DAG, the state tree, the behavior tree, the
/// mempool, and the DAG frontier.
///
/// `Controller` is a cheap clone over shared inner state. All state-tree
/// mutation is serialized by an internal write lock; reads go through
/// copy-on-write snapshots and never block the writer.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    state_uri: String,
    write_lock: Mutex<()>,

    tx_store: Arc<dyn TxStore>,
    behavior: RwLock<BehaviorTree>,
    registry: Arc<PluginRegistry>,
    states: StateTree,
    indices: IndexStore,
    leaves: RwLock<HashSet<TxId>>,

    mempool: Mutex<Vec<Tx>>,
    ch_mempool: mpsc::UnboundedSender<()>,
    ch_downloaded_ref: mpsc::UnboundedSender<()>,
    rx_mempool: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    rx_downloaded_ref: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    started: AtomicBool,

    on_tx_processed: TxProcessedHandler,
}

impl Controller {
    pub fn new(
        state_uri: &str,
        tx_store: Arc<dyn TxStore>,
        registry: Arc<PluginRegistry>,
        on_tx_processed: TxProcessedHandler,
    ) -> Self {
        let (ch_mempool, rx_mempool) = mpsc::unbounded_channel();
        let (ch_downloaded_ref, rx_downloaded_ref) = mpsc::unbounded_channel();

        let mut behavior = BehaviorTree::new();
        behavior.add_resolver(Keypath::root(), Arc::new(LastWriterResolver));

        Self {
            inner: Arc::new(Inner {
                state_uri: state_uri.to_string(),
                write_lock: Mutex::new(()),
                tx_store,
                behavior: RwLock::new(behavior),
                registry,
                states: StateTree::new(),
                indices: IndexStore::new(),
                leaves: RwLock::new(HashSet::new()),
                mempool: Mutex::new(Vec::new()),
                ch_mempool,
                ch_downloaded_ref,
                rx_mempool: Mutex::new(Some(rx_mempool)),
                rx_downloaded_ref: Mutex::new(Some(rx_downloaded_ref)),
                started: AtomicBool::new(false),
                on_tx_processed,
            }),
        }
    }

    pub fn state_uri(&self) -> &str {
        &self.inner.state_uri
    }

    /// Spawn the mempool worker. Idempotent; requires a tokio runtime.
    ///
    /// The worker holds only a weak handle, so dropping every `Controller`
    /// closes the channels and ends the loop.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx_mempool = self
            .inner
            .rx_mempool
            .lock()
            .expect("controller lock poisoned")
            .take()
            .expect("mempool receiver already taken");
        let mut rx_downloaded_ref = self
            .inner
            .rx_downloaded_ref
            .lock()
            .expect("controller lock poisoned")
            .take()
            .expect("ref receiver already taken");

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx_mempool.recv() => if msg.is_none() { break },
                    msg = rx_downloaded_ref.recv() => if msg.is_none() { break },
                }
                let Some(inner) = weak.upgrade() else { break };
                Controller { inner }.process_mempool();
            }
            debug!("mempool worker stopped");
        });
    }

    /// Accept a candidate tx: store it unvalidated and queue it for the
    /// mempool. Already-known txs are ignored.
    pub fn add_tx(&self, tx: &Tx) -> ControllerResult<()> {
        if self.inner.tx_store.tx_exists(&self.inner.state_uri, &tx.id)? {
            info!(tx = %tx.id.short_hex(), "already know tx, skipping");
            return Ok(());
        }
        info!(tx = %tx.id.short_hex(), "new tx");

        let mut tx = tx.clone();
        tx.valid = false;
        self.inner.tx_store.add_tx(&tx)?;

        self.inner
            .mempool
            .lock()
            .expect("controller lock poisoned")
            .push(tx);
        let _ = self.inner.ch_mempool.send(());
        Ok(())
    }

    pub fn have_tx(&self, id: &TxId) -> bool {
        self.inner
            .tx_store
            .tx_exists(&self.inner.state_uri, id)
            .unwrap_or(false)
    }

    /// Signal that a missing ref finished downloading; wakes the mempool.
    pub fn on_downloaded_ref(&self) {
        let _ = self.inner.ch_downloaded_ref.send(());
    }

    /// The current DAG frontier.
    pub fn leaves(&self) -> HashSet<TxId> {
        self.inner
            .leaves
            .read()
            .expect("controller lock poisoned")
            .clone()
    }

    /// Read-only state snapshot; `None` reads current.
    pub fn state_at_version(&self, version: Option<&Version>) -> ControllerResult<MemoryNode> {
        Ok(self.inner.states.state_at_version(version)?)
    }

    /// All stored txs for this state URI (history replay).
    pub fn fetch_txs(&self) -> ControllerResult<Vec<Tx>> {
        self.inner.tx_store.all_txs(&self.inner.state_uri)
    }

    /// Run mempool passes until a pass makes no progress.
    ///
    /// Each pass attempts every pending tx and partitions the results:
    /// applied, dropped (fatal), or still blocked (retryable). Repeating
    /// while any tx succeeded gives fixed-point convergence when one arrival
    /// unblocks a chain.
    pub fn process_mempool(&self) {
        loop {
            let pending: Vec<Tx> = std::mem::take(
                &mut *self.inner.mempool.lock().expect("controller lock poisoned"),
            );
            if pending.is_empty() {
                return;
            }

            let mut any_succeeded = false;
            let mut still_blocked = Vec::new();
            for tx in pending {
                match self.process_tx(&tx) {
                    Ok(()) => {
                        any_succeeded = true;
                        info!(tx = %tx.id.short_hex(), "tx added to chain");
                    }
                    Err(err) if err.is_retryable() => {
                        debug!(tx = %tx.id.short_hex(), %err, "re-adding to mempool");
                        still_blocked.push(tx);
                    }
                    Err(err) => {
                        warn!(tx = %tx.id.short_hex(), %err, "invalid tx dropped");
                    }
                }
            }

            self.inner
                .mempool
                .lock()
                .expect("controller lock poisoned")
                .extend(still_blocked);

            if !any_succeeded {
                return;
            }
        }
    }

    fn process_tx(&self, tx: &Tx) -> ControllerResult<()> {
        let _guard = self.inner.write_lock.lock().expect("controller lock poisoned");

        self.validate_tx_intrinsics(tx)?;

        let mut state = self.inner.states.writable();

        // Private txs live under their derived private root.
        let patches: Vec<Patch> = if tx.is_private() {
            let root = Keypath::from(tx.private_root_key());
            tx.patches
                .iter()
                .map(|p| Patch::new(root.push(&p.keypath), p.range, p.val.clone()))
                .collect()
        } else {
            tx.patches.clone()
        };

        // Validators, deepest prefix first. Each validator sees only the
        // patches under its prefix, relativized.
        {
            let behavior = self.inner.behavior.read().expect("controller lock poisoned");
            let mut remaining = patches.clone();
            for (prefix, validators) in behavior.validators_deepest_first() {
                let (matching, rest) = split_patches(remaining, &prefix);
                let mut tx_view = tx.clone();
                tx_view.patches = matching;

                let subtree = state.at_keypath(&prefix, None);
                for validator in &validators {
                    validator.validate_tx(&subtree, &tx_view)?;
                }
                remaining = rest;
            }
        }

        // Resolvers, deepest prefix first. The sibling `Merge-Type` config
        // is unmounted (diff disabled) around the resolver call so a
        // resolver never sees its own configuration.
        {
            let behavior = self.inner.behavior.read().expect("controller lock poisoned");
            let mut remaining = patches;
            for (prefix, resolver) in behavior.resolvers_deepest_first() {
                let (matching, rest) = split_patches(remaining, &prefix);
                if matching.is_empty() {
                    remaining = rest;
                    continue;
                }

                let merge_type_kp = Keypath::from(MERGE_TYPE_KEY);
                let resolver_config = state.value(&prefix.push(&merge_type_kp), None)?;
                let mut subtree = state.at_keypath(&prefix, None);

                if resolver_config.is_some() {
                    state.set_diff_enabled(false);
                    subtree.delete(&merge_type_kp, None)?;
                    state.set_diff_enabled(true);
                }

                resolver.resolve_state(&mut subtree, tx.from, tx.id, &tx.parents, &matching)?;

                if let Some(config) = resolver_config {
                    state.set_diff_enabled(false);
                    subtree.set(&merge_type_kp, None, config)?;
                    state.set_diff_enabled(true);
                }

                remaining = rest;
            }
        }

        (self.inner.on_tx_processed)(self, tx, &mut state)?;

        self.inner.states.commit(state);

        if tx.checkpoint {
            self.inner.states.copy_version(tx.id.into(), None)?;
        }

        // The parents stop being leaves; this tx becomes one.
        {
            let mut leaves = self.inner.leaves.write().expect("controller lock poisoned");
            for parent in &tx.parents {
                leaves.remove(parent);
            }
            leaves.insert(tx.id);
        }

        let mut validated = tx.clone();
        validated.valid = true;
        self.inner.tx_store.add_tx(&validated)?;
        Ok(())
    }

    fn validate_tx_intrinsics(&self, tx: &Tx) -> ControllerResult<()> {
        if tx.parents.is_empty() && !tx.is_genesis() {
            return Err(ControllerError::MissingParents);
        }

        for parent in &tx.parents {
            match self.inner.tx_store.fetch_tx(&self.inner.state_uri, parent) {
                Err(ControllerError::NotFound) => {
                    return Err(ControllerError::NoParentYet(*parent));
                }
                Err(err) => return Err(err),
                Ok(parent_tx) => {
                    if !parent_tx.valid && *parent != TxId::genesis() {
                        return Err(ControllerError::NoParentYet(*parent));
                    }
                }
            }
        }

        if !tx.is_genesis() {
            let pubkey = recover_signing_pubkey(&tx.hash(), &tx.sig)
                .map_err(|e| ControllerError::InvalidSignature(e.to_string()))?;
            if !pubkey.verify(&tx.hash(), &tx.sig) {
                return Err(ControllerError::InvalidSignature("cannot be verified".into()));
            }
            if pubkey.address() != tx.from {
                return Err(ControllerError::InvalidSignature(format!(
                    "address mismatch: expected {}, recovered {}",
                    tx.from.short_hex(),
                    pubkey.address().short_hex()
                )));
            }
        }

        Ok(())
    }

    /// Re-read plugin configs touched by the diff and mount/unmount the
    /// matching plugins before the next tx is processed.
    pub fn reconcile_behavior_tree(&self, state: &MemoryNode) -> ControllerResult<()> {
        let diff = state.diff();

        let mut resolver_mounts: HashSet<Keypath> = HashSet::new();
        let mut validator_mounts: HashSet<Keypath> = HashSet::new();
        let mut indexer_mounts: HashSet<(Keypath, String)> = HashSet::new();

        for keypath in diff.added().iter().chain(diff.removed().iter()) {
            let parts = keypath.parts();
            for (i, part) in parts.iter().enumerate() {
                let name = String::from_utf8_lossy(part.as_bytes());
                let mount = join_parts(&parts[..i]);
                if name == MERGE_TYPE_KEY {
                    resolver_mounts.insert(mount);
                    break;
                } else if name == VALIDATOR_KEY {
                    validator_mounts.insert(mount);
                    break;
                } else if name == INDEXES_KEY {
                    if let Some(index_name) = parts.get(i + 1) {
                        indexer_mounts.insert((
                            mount,
                            String::from_utf8_lossy(index_name.as_bytes()).into_owned(),
                        ));
                    }
                    break;
                }
            }
        }

        let mut behavior = self.inner.behavior.write().expect("controller lock poisoned");

        for mount in resolver_mounts {
            let config_kp = mount.push(&Keypath::from(MERGE_TYPE_KEY));
            match state.value(&config_kp, None)? {
                Some(config) => {
                    let resolver = self.inner.registry.make_resolver(&config)?;
                    behavior.add_resolver(mount, resolver);
                }
                None if mount.is_root() => {
                    behavior.add_resolver(Keypath::root(), Arc::new(LastWriterResolver));
                }
                None => behavior.remove_resolver(&mount),
            }
        }

        for mount in validator_mounts {
            let config_kp = mount.push(&Keypath::from(VALIDATOR_KEY));
            behavior.remove_validators(&mount);
            if let Some(config) = state.value(&config_kp, None)? {
                let validator = self.inner.registry.make_validator(&config)?;
                behavior.add_validator(mount, validator);
            }
        }

        for (mount, index_name) in indexer_mounts {
            let config_kp = mount
                .push(&Keypath::from(INDEXES_KEY))
                .push(&Keypath::from(index_name.as_str()));
            if let Some(config) = state.value(&config_kp, None)? {
                let indexer = self.inner.registry.make_indexer(&config)?;
                behavior.set_indexer(mount, index_name, indexer);
            }
        }

        Ok(())
    }

    /// Query a secondary index, building it lazily for the requested
    /// version.
    pub fn query_index(
        &self,
        version: Option<&Version>,
        keypath: &Keypath,
        index_name: &str,
        query_param: &Keypath,
        rng: Option<Range>,
    ) -> ControllerResult<MemoryNode> {
        let resolved = version.copied().unwrap_or_else(Version::current);

        if let Some(index) = self
            .inner
            .indices
            .index_at_version(&resolved, keypath, index_name)
        {
            if index.exists(query_param) {
                return Ok(index.at_keypath(query_param, rng));
            }
        }

        let indexer = self
            .inner
            .behavior
            .read()
            .expect("controller lock poisoned")
            .indexer(keypath, index_name)
            .ok_or(ControllerError::NotFound)?;

        let state = self.inner.states.state_at_version(version)?;
        let subtree = state.at_keypath(keypath, None);
        let index_value = indexer.build_index(&subtree)?;

        let mut index_node = MemoryNode::new();
        index_node.set(&Keypath::root(), None, index_value)?;
        self.inner.indices.store_index(
            resolved,
            keypath.clone(),
            index_name.to_string(),
            index_node.clone(),
        );

        if !index_node.exists(query_param) {
            return Err(ControllerError::NotFound);
        }
        Ok(index_node.at_keypath(query_param, rng))
    }

    #[cfg(test)]
    pub(crate) fn behavior_has_resolver(&self, keypath: &Keypath) -> bool {
        self.inner
            .behavior
            .read()
            .unwrap()
            .has_resolver(keypath)
    }
}

fn split_patches(patches: Vec<Patch>, prefix: &Keypath) -> (Vec<Patch>, Vec<Patch>) {
    let mut matching = Vec::new();
    let mut rest = Vec::new();
    for patch in patches {
        if patch.keypath.starts_with(prefix) {
            matching.push(patch.relative_to(prefix));
        } else {
            rest.push(patch);
        }
    }
    (matching, rest)
}

fn join_parts(parts: &[Keypath]) -> Keypath {
    let mut kp = Keypath::root();
    for part in parts {
        kp = kp.push(part);
    }
    kp
}
