//! In-process transport for exercising the host end to end in tests.
//!
//! A [`MemNetwork`] is a registry of named nodes. Connections are pairs of
//! unbounded channels; a dispatcher task on the remote side routes frames
//! into the remote transport's registered handlers, and `subscribe` frames
//! register the connection's reply channel as a subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use canopy_protocol::Msg;
use canopy_types::{Address, Hash};

use crate::error::{HostError, HostResult};
use crate::transport::{
    AckHandler, FetchHistoryHandler, FetchRefHandler, Peer, PeerHandle, PrivateTxHandler,
    Transport, TxHandler, VerifyAddressHandler,
};

pub const TRANSPORT_NAME: &str = "mem";

#[derive(Default)]
pub struct MemNetwork {
    nodes: RwLock<HashMap<String, Arc<MemTransport>>>,
    ref_providers: RwLock<HashMap<Hash, HashSet<String>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a transport for a named node.
    pub fn transport(self: &Arc<Self>, node: &str) -> Arc<MemTransport> {
        let transport = Arc::new_cyclic(|self_weak| MemTransport {
            node: node.to_string(),
            network: Arc::downgrade(self),
            self_weak: self_weak.clone(),
            handlers: RwLock::new(Handlers::default()),
            providing: RwLock::new(HashSet::new()),
            claimed: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
        });
        self.nodes
            .write()
            .unwrap()
            .insert(node.to_string(), Arc::clone(&transport));
        transport
    }

    fn node(&self, name: &str) -> Option<Arc<MemTransport>> {
        self.nodes.read().unwrap().get(name).cloned()
    }
}

#[derive(Default)]
struct Handlers {
    tx: Option<TxHandler>,
    private_tx: Option<PrivateTxHandler>,
    ack: Option<AckHandler>,
    verify_address: Option<VerifyAddressHandler>,
    fetch_ref: Option<FetchRefHandler>,
    fetch_history: Option<FetchHistoryHandler>,
}

pub struct MemTransport {
    node: String,
    network: Weak<MemNetwork>,
    self_weak: Weak<MemTransport>,
    handlers: RwLock<Handlers>,
    providing: RwLock<HashSet<String>>,
    claimed: RwLock<Option<Address>>,
    // state URI -> subscriber node -> reply channel
    subscribers: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<Msg>>>>,
}

impl MemTransport {
    /// Mark this node as a provider of a state URI.
    pub fn provide(&self, state_uri: &str) {
        self.providing.write().unwrap().insert(state_uri.to_string());
    }

    /// Claim an address for discovery; the host still verifies it with a
    /// challenge.
    pub fn claim(&self, address: Address) {
        *self.claimed.write().unwrap() = Some(address);
    }

    fn strong(&self) -> Arc<MemTransport> {
        self.self_weak.upgrade().expect("transport dropped")
    }
}

struct MemPeer {
    remote_node: String,
    out: mpsc::UnboundedSender<Msg>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Msg>>,
    address: RwLock<Option<Address>>,
}

impl MemPeer {
    /// A write-only view for handlers and subscriber fan-out.
    fn write_only(remote_node: String, out: mpsc::UnboundedSender<Msg>) -> Arc<MemPeer> {
        let (_closed_tx, closed_rx) = mpsc::unbounded_channel();
        Arc::new(MemPeer {
            remote_node,
            out,
            inbox: tokio::sync::Mutex::new(closed_rx),
            address: RwLock::new(None),
        })
    }
}

#[async_trait]
impl Peer for MemPeer {
    fn id(&self) -> String {
        self.remote_node.clone()
    }

    fn transport_name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn reachable_at(&self) -> String {
        self.remote_node.clone()
    }

    fn address(&self) -> Option<Address> {
        *self.address.read().unwrap()
    }

    fn set_address(&self, address: Address) {
        *self.address.write().unwrap() = Some(address);
    }

    async fn ensure_connected(&self) -> HostResult<()> {
        Ok(())
    }

    async fn write_msg(&self, msg: Msg) -> HostResult<()> {
        self.out
            .send(msg)
            .map_err(|_| HostError::Transport("peer disconnected".into()))
    }

    async fn read_msg(&self) -> HostResult<Msg> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| HostError::Transport("connection closed".into()))
    }

    async fn close_conn(&self) -> HostResult<()> {
        Ok(())
    }
}

/// Open a duplex connection from `local` to `remote`: the returned handle
/// writes into a dispatcher task on the remote side and reads the remote's
/// replies.
fn connect(local: &Arc<MemTransport>, remote: &Arc<MemTransport>) -> PeerHandle {
    let (to_remote_tx, mut to_remote_rx) = mpsc::unbounded_channel::<Msg>();
    let (to_local_tx, to_local_rx) = mpsc::unbounded_channel::<Msg>();

    let peer = Arc::new(MemPeer {
        remote_node: remote.node.clone(),
        out: to_remote_tx,
        inbox: tokio::sync::Mutex::new(to_local_rx),
        address: RwLock::new(None),
    });

    let remote = Arc::clone(remote);
    let local_name = local.node.clone();
    tokio::spawn(async move {
        let view: PeerHandle = MemPeer::write_only(local_name.clone(), to_local_tx.clone());

        while let Some(msg) = to_remote_rx.recv().await {
            match msg {
                Msg::Subscribe(uri) => {
                    remote
                        .subscribers
                        .write()
                        .unwrap()
                        .entry(uri)
                        .or_default()
                        .insert(local_name.clone(), to_local_tx.clone());
                }
                Msg::Unsubscribe(uri) => {
                    if let Some(subs) = remote.subscribers.write().unwrap().get_mut(&uri) {
                        subs.remove(&local_name);
                    }
                }
                Msg::Put(tx) => {
                    let handler = remote.handlers.read().unwrap().tx.clone();
                    if let Some(handler) = handler {
                        handler(tx, view.clone()).await;
                    }
                }
                Msg::Private(encrypted) => {
                    let handler = remote.handlers.read().unwrap().private_tx.clone();
                    if let Some(handler) = handler {
                        handler(encrypted, view.clone()).await;
                    }
                }
                Msg::Ack(tx_id) => {
                    let handler = remote.handlers.read().unwrap().ack.clone();
                    if let Some(handler) = handler {
                        handler(tx_id, view.clone()).await;
                    }
                }
                Msg::VerifyAddress(challenge) => {
                    let handler = remote.handlers.read().unwrap().verify_address.clone();
                    if let Some(handler) = handler {
                        handler(challenge, view.clone()).await;
                    }
                }
                Msg::FetchRef(hash) => {
                    let handler = remote.handlers.read().unwrap().fetch_ref.clone();
                    if let Some(handler) = handler {
                        handler(hash, view.clone()).await;
                    }
                }
                other => {
                    tracing::warn!(kind = other.type_name(), "mem transport ignoring message");
                }
            }
        }
    });

    peer
}

#[async_trait]
impl Transport for MemTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    async fn start(&self) -> HostResult<()> {
        Ok(())
    }

    fn set_tx_handler(&self, handler: TxHandler) {
        self.handlers.write().unwrap().tx = Some(handler);
    }

    fn set_private_tx_handler(&self, handler: PrivateTxHandler) {
        self.handlers.write().unwrap().private_tx = Some(handler);
    }

    fn set_ack_handler(&self, handler: AckHandler) {
        self.handlers.write().unwrap().ack = Some(handler);
    }

    fn set_verify_address_handler(&self, handler: VerifyAddressHandler) {
        self.handlers.write().unwrap().verify_address = Some(handler);
    }

    fn set_fetch_ref_handler(&self, handler: FetchRefHandler) {
        self.handlers.write().unwrap().fetch_ref = Some(handler);
    }

    fn set_fetch_history_handler(&self, handler: FetchHistoryHandler) {
        self.handlers.write().unwrap().fetch_history = Some(handler);
    }

    async fn get_peer_by_conn_strings(&self, reachable_at: &str) -> HostResult<PeerHandle> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| HostError::Transport("network gone".into()))?;
        let remote = network
            .node(reachable_at)
            .ok_or_else(|| HostError::Transport(format!("unknown node {reachable_at}")))?;
        Ok(connect(&self.strong(), &remote))
    }

    async fn providers_of_state_uri(
        &self,
        state_uri: &str,
    ) -> HostResult<mpsc::Receiver<PeerHandle>> {
        let (tx, rx) = mpsc::channel(64);
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| HostError::Transport("network gone".into()))?;
        let this = self.strong();
        for (name, node) in network.nodes.read().unwrap().iter() {
            if name == &self.node {
                continue;
            }
            if node.providing.read().unwrap().contains(state_uri) {
                let _ = tx.try_send(connect(&this, node));
            }
        }
        Ok(rx)
    }

    async fn providers_of_ref(&self, hash: &Hash) -> HostResult<mpsc::Receiver<PeerHandle>> {
        let (tx, rx) = mpsc::channel(64);
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| HostError::Transport("network gone".into()))?;
        let this = self.strong();
        let providers = network
            .ref_providers
            .read()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_default();
        for name in providers {
            if name == self.node {
                continue;
            }
            if let Some(node) = network.node(&name) {
                let _ = tx.try_send(connect(&this, &node));
            }
        }
        Ok(rx)
    }

    async fn subscribers_to_state_uri(
        &self,
        state_uri: &str,
    ) -> HostResult<mpsc::Receiver<PeerHandle>> {
        let (tx, rx) = mpsc::channel(64);
        let subscribers = self
            .subscribers
            .read()
            .unwrap()
            .get(state_uri)
            .cloned()
            .unwrap_or_default();
        for (name, sender) in subscribers {
            let _ = tx.try_send(MemPeer::write_only(name, sender) as PeerHandle);
        }
        Ok(rx)
    }

    async fn peers_claiming_address(
        &self,
        address: &Address,
    ) -> HostResult<mpsc::Receiver<PeerHandle>> {
        let (tx, rx) = mpsc::channel(64);
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| HostError::Transport("network gone".into()))?;
        let this = self.strong();
        for (name, node) in network.nodes.read().unwrap().iter() {
            if name == &self.node {
                continue;
            }
            if node.claimed.read().unwrap().as_ref() == Some(address) {
                let _ = tx.try_send(connect(&this, node));
            }
        }
        Ok(rx)
    }

    async fn announce_ref(&self, hash: &Hash) -> HostResult<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| HostError::Transport("network gone".into()))?;
        network
            .ref_providers
            .write()
            .unwrap()
            .entry(*hash)
            .or_default()
            .insert(self.node.clone());
        Ok(())
    }
}
