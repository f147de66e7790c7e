//! Client registry: the channel membership map
//!
//! The registry is the only shared mutable state in the server. It keeps
//! two coherent maps (client→channel and channel→clients) behind one
//! lock, so every mutation is serialized and every read observes a
//! consistent pair. Per-channel membership is handed out as an owned
//! snapshot the caller iterates without holding the lock; fan-out depends
//! on this.
//!
//! There is no process-wide instance. The registry is constructed once and
//! passed by `Arc` to the listener, every connection handler, and the HTTP
//! state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::protocol::QUARANTINE_CHANNEL;

/// The minimal client capability the registry depends on. Production
/// clients are connection handles; tests use fixed-value doubles.
pub trait ClientInfo: Send + Sync + 'static {
    /// Process-unique client ID
    fn id(&self) -> u32;
    /// Authenticated username, if any
    fn alias(&self) -> Option<String>;
    /// Remote address string
    fn remote(&self) -> String;
}

/// Registry size snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreInfo {
    /// Number of channels with at least one member
    pub channel_count: usize,
    /// Number of registered clients
    pub client_count: usize,
    /// The ID the client factory will issue next
    pub next_client_id: u32,
    /// Seconds since the registry was created
    pub uptime: f64,
}

/// Per-client introspection record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEntry {
    pub alias: Option<String>,
    pub channel: u32,
    pub remote: String,
}

/// Snapshot of every registered client, keyed by ID
pub type ClientInfos = BTreeMap<u32, ClientEntry>;

struct RegistryState<C> {
    /// client id → channel; every client is in at most one channel
    channel_by_client: HashMap<u32, u32>,
    /// channel → members; a channel key never maps to an empty set
    clients_by_channel: HashMap<u32, HashMap<u32, Arc<C>>>,
}

/// Concurrent channel↔clients mapping plus the client ID factory
pub struct ClientRegistry<C> {
    state: RwLock<RegistryState<C>>,
    next_id: AtomicU32,
    created_at: Instant,
}

impl<C: ClientInfo> ClientRegistry<C> {
    /// Create an empty registry. IDs start at 0 and wrap on overflow.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                channel_by_client: HashMap::new(),
                clients_by_channel: HashMap::new(),
            }),
            next_id: AtomicU32::new(0),
            created_at: Instant::now(),
        }
    }

    /// Issue the next client ID.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Put `client` on `channel`.
    ///
    /// Re-assigning to the channel the client is already on is a no-op and
    /// returns `false`. Moving from another channel removes the client
    /// there first, collapsing the old channel if it became empty. Returns
    /// `true` on any mutation.
    pub async fn add(&self, client: &Arc<C>, channel: u32) -> bool {
        let mut state = self.state.write().await;
        let id = client.id();

        if state.channel_by_client.get(&id) == Some(&channel) {
            return false;
        }
        if let Some(previous) = state.channel_by_client.insert(id, channel) {
            detach(&mut state.clients_by_channel, previous, id);
        }
        state
            .clients_by_channel
            .entry(channel)
            .or_default()
            .insert(id, Arc::clone(client));
        true
    }

    /// Remove a client entirely. Returns `false` if it was not registered.
    pub async fn remove(&self, client_id: u32) -> bool {
        let mut state = self.state.write().await;
        let Some(channel) = state.channel_by_client.remove(&client_id) else {
            return false;
        };
        detach(&mut state.clients_by_channel, channel, client_id);
        true
    }

    /// Empty both maps.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.channel_by_client.clear();
        state.clients_by_channel.clear();
    }

    /// Snapshot the members of `client_id`'s channel, excluding the client
    /// itself. Empty if the client is not registered, or if it sits on the
    /// quarantine channel and `ignore_channel_zero` is set.
    pub async fn peers_on_same_channel(
        &self,
        client_id: u32,
        ignore_channel_zero: bool,
    ) -> Vec<Arc<C>> {
        let state = self.state.read().await;
        let Some(&channel) = state.channel_by_client.get(&client_id) else {
            return Vec::new();
        };
        if ignore_channel_zero && channel == QUARANTINE_CHANNEL {
            return Vec::new();
        }
        state
            .clients_by_channel
            .get(&channel)
            .map(|members| {
                members
                    .iter()
                    .filter(|(id, _)| **id != client_id)
                    .map(|(_, client)| Arc::clone(client))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Consistent size snapshot.
    pub async fn store_info(&self) -> StoreInfo {
        let state = self.state.read().await;
        StoreInfo {
            channel_count: state.clients_by_channel.len(),
            client_count: state.channel_by_client.len(),
            next_client_id: self.next_id.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed().as_secs_f64(),
        }
    }

    /// Consistent per-client snapshot.
    pub async fn client_infos(&self) -> ClientInfos {
        let state = self.state.read().await;
        state
            .clients_by_channel
            .iter()
            .flat_map(|(channel, members)| {
                members.values().map(|client| {
                    (
                        client.id(),
                        ClientEntry {
                            alias: client.alias(),
                            channel: *channel,
                            remote: client.remote(),
                        },
                    )
                })
            })
            .collect()
    }
}

impl<C: ClientInfo> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `client_id` from `channel`'s member set, dropping the channel
/// entry if the set became empty.
fn detach<C>(channels: &mut HashMap<u32, HashMap<u32, Arc<C>>>, channel: u32, client_id: u32) {
    if let Some(members) = channels.get_mut(&channel) {
        members.remove(&client_id);
        if members.is_empty() {
            channels.remove(&channel);
        }
    }
}
