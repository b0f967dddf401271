// Connection hub: per-connection outbound queues, identity binding and
// group fan-out.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use huddle_common::{protocol::ServerEvent, types::Identity};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// A fan-out group a connection can belong to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Channel(String),
    Room(String),
}

#[derive(Debug)]
struct ConnectionRecord {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    identity: Option<Identity>,
    groups: BTreeSet<GroupKey>,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    groups: HashMap<GroupKey, HashSet<ConnectionId>>,
    identities: HashMap<String, ConnectionId>,
}

/// Everything a connection had joined at the moment it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub identity: Option<Identity>,
    pub groups: BTreeSet<GroupKey>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConnectionHub {
    state: RwLock<HubState>,
}

impl ConnectionHub {
    /// Register a connection and return its id. Events emitted to it are
    /// queued on `outbound`; sends never wait on the socket.
    pub async fn register(&self, outbound: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let record = ConnectionRecord {
            outbound,
            identity: None,
            groups: BTreeSet::new(),
            connected_at: Utc::now(),
        };
        self.state.write().await.connections.insert(connection_id, record);
        connection_id
    }

    /// Bind (or rebind) the identity speaking on a connection. The most
    /// recent binding of an identity id wins for targeted delivery.
    pub async fn bind_identity(&self, connection_id: ConnectionId, identity: Identity) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.connections.get_mut(&connection_id) else {
            return false;
        };

        if let Some(previous) = record.identity.as_ref() {
            if previous.id != identity.id
                && state.identities.get(&previous.id) == Some(&connection_id)
            {
                state.identities.remove(&previous.id);
            }
        }
        state.identities.insert(identity.id.clone(), connection_id);
        record.identity = Some(identity);
        true
    }

    pub async fn identity(&self, connection_id: ConnectionId) -> Option<Identity> {
        self.state.read().await.connections.get(&connection_id)?.identity.clone()
    }

    pub async fn join_group(&self, connection_id: ConnectionId, group: GroupKey) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        record.groups.insert(group.clone());
        state.groups.entry(group).or_default().insert(connection_id);
        true
    }

    pub async fn leave_group(&self, connection_id: ConnectionId, group: &GroupKey) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(record) = state.connections.get_mut(&connection_id) {
            record.groups.remove(group);
        }
        if let Some(members) = state.groups.get_mut(group) {
            members.remove(&connection_id);
            if members.is_empty() {
                state.groups.remove(group);
            }
        }
    }

    pub async fn is_in_group(&self, connection_id: ConnectionId, group: &GroupKey) -> bool {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub async fn connection_for_identity(&self, identity_id: &str) -> Option<ConnectionId> {
        self.state.read().await.identities.get(identity_id).copied()
    }

    pub async fn emit_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let guard = self.state.read().await;
        match guard.connections.get(&connection_id) {
            Some(record) => record.outbound.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver to whichever connection last bound `identity_id`.
    pub async fn emit_to_identity(&self, identity_id: &str, event: ServerEvent) -> bool {
        let guard = self.state.read().await;
        guard
            .identities
            .get(identity_id)
            .and_then(|connection_id| guard.connections.get(connection_id))
            .is_some_and(|record| record.outbound.send(event).is_ok())
    }

    /// Fan out to every connection in `group`; returns the number of queues
    /// that accepted the event.
    pub async fn emit_to_group(&self, group: &GroupKey, event: ServerEvent) -> usize {
        self.emit_to_group_filtered(group, None, event).await
    }

    pub async fn emit_to_group_except(
        &self,
        group: &GroupKey,
        excluded: ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.emit_to_group_filtered(group, Some(excluded), event).await
    }

    pub async fn emit_to_all(&self, event: ServerEvent) -> usize {
        let guard = self.state.read().await;
        guard
            .connections
            .values()
            .filter(|record| record.outbound.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Remove a connection. Only the first call for a given id returns its
    /// departure record; later calls return `None`, so teardown driven by
    /// the record runs exactly once.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let record = state.connections.remove(&connection_id)?;

        for group in &record.groups {
            if let Some(members) = state.groups.get_mut(group) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.groups.remove(group);
                }
            }
        }
        if let Some(identity) = record.identity.as_ref() {
            if state.identities.get(&identity.id) == Some(&connection_id) {
                state.identities.remove(&identity.id);
            }
        }

        Some(Departure {
            connection_id,
            identity: record.identity,
            groups: record.groups,
            connected_at: record.connected_at,
        })
    }

    async fn emit_to_group_filtered(
        &self,
        group: &GroupKey,
        excluded: Option<ConnectionId>,
        event: ServerEvent,
    ) -> usize {
        let guard = self.state.read().await;
        let Some(members) = guard.groups.get(group) else {
            return 0;
        };

        members
            .iter()
            .filter(|connection_id| Some(**connection_id) != excluded)
            .filter_map(|connection_id| guard.connections.get(connection_id))
            .filter(|record| record.outbound.send(event.clone()).is_ok())
            .count()
    }
}
