use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use zeroize::Zeroizing;

use voicehub_crypto::{generate_key, KEY_LEN};
use voicehub_protocol::ChannelSummary;

use crate::store::UserStore;

/// Stable handle for a live control connection. Channel membership is
/// keyed by this, never by references into the connection table.
pub type ConnId = u64;

/// Channels that exist from server start. Everything else is created
/// lazily on first join.
pub const DEFAULT_CHANNELS: [&str; 2] = ["General", "Gaming"];

/// Per-connection state owned by the control endpoint.
#[allow(dead_code)]
pub struct ClientConn {
    pub conn_id: ConnId,
    pub peer_addr: SocketAddr,
    /// Sender for pushing control frames to this connection's writer task.
    pub tcp_tx: mpsc::Sender<Vec<u8>>,
    pub authenticated: bool,
    /// Empty until login succeeds.
    pub session_id: String,
    pub username: String,
    /// Empty ⇔ not in any channel.
    pub current_channel: String,
    /// The UDP endpoint announced in the login message.
    pub udp_endpoint: Option<SocketAddr>,
}

/// A named room. The key is generated when the channel is created and
/// never changes for the life of the process, so members joining at
/// different times share it.
pub struct Channel {
    pub members: HashSet<ConnId>,
    pub key: Zeroizing<[u8; KEY_LEN]>,
}

impl Channel {
    fn new() -> Self {
        Self {
            members: HashSet::new(),
            key: Zeroizing::new(generate_key()),
        }
    }
}

/// The shared server state, designed for concurrent access.
///
/// Membership (`channels`) and connection records (`connections`) are
/// two independent maps keyed by stable identifiers; membership is
/// the single source of truth for who is in a channel.
pub struct ServerState {
    /// All live control connections, keyed by conn_id.
    pub connections: DashMap<ConnId, ClientConn>,
    /// All channels, keyed by name. Empty channels are kept so that
    /// their keys stay stable.
    pub channels: RwLock<HashMap<String, Channel>>,
    /// Reverse lookup: announced UDP endpoint -> conn_id, used to
    /// attribute incoming voice datagrams.
    pub endpoint_to_conn: DashMap<SocketAddr, ConnId>,
    /// Credential and session store, one lock per state-machine step.
    pub store: Mutex<UserStore>,
    /// UDP port, sent to clients in login_success.
    pub voice_port: u16,
    next_conn_id: AtomicU64,
}

impl ServerState {
    pub fn new(store: UserStore, voice_port: u16) -> Self {
        let mut channels = HashMap::new();
        for name in DEFAULT_CHANNELS {
            channels.insert(name.to_string(), Channel::new());
        }

        Self {
            connections: DashMap::new(),
            channels: RwLock::new(channels),
            endpoint_to_conn: DashMap::new(),
            store: Mutex::new(store),
            voice_port,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Record a freshly accepted connection and hand back its id.
    pub fn register_connection(
        &self,
        peer_addr: SocketAddr,
        tcp_tx: mpsc::Sender<Vec<u8>>,
    ) -> ConnId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            conn_id,
            ClientConn {
                conn_id,
                peer_addr,
                tcp_tx,
                authenticated: false,
                session_id: String::new(),
                username: String::new(),
                current_channel: String::new(),
                udp_endpoint: None,
            },
        );
        conn_id
    }

    /// The channel key for `name`, creating the channel if needed.
    pub async fn ensure_channel(&self, name: &str) -> [u8; KEY_LEN] {
        let mut channels = self.channels.write().await;
        *channels
            .entry(name.to_string())
            .or_insert_with(Channel::new)
            .key
    }

    /// Add a connection to a channel (creating it lazily) and return
    /// the other members to notify. The caller must have removed the
    /// connection from its previous channel first.
    pub async fn join_channel(&self, conn_id: ConnId, name: &str) -> Vec<ConnId> {
        let mut channels = self.channels.write().await;
        let channel = channels.entry(name.to_string()).or_insert_with(Channel::new);

        let others: Vec<ConnId> = channel.members.iter().copied().collect();
        channel.members.insert(conn_id);
        drop(channels);

        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            conn.current_channel = name.to_string();
        }

        others
    }

    /// Remove a connection from its current channel, if any.
    /// Returns the channel name and the remaining members.
    pub async fn leave_current_channel(&self, conn_id: ConnId) -> Option<(String, Vec<ConnId>)> {
        let channel_name = {
            let mut conn = self.connections.get_mut(&conn_id)?;
            if conn.current_channel.is_empty() {
                return None;
            }
            std::mem::take(&mut conn.current_channel)
        };

        let mut channels = self.channels.write().await;
        let channel = channels.get_mut(&channel_name)?;
        if !channel.members.remove(&conn_id) {
            return None;
        }
        let remaining: Vec<ConnId> = channel.members.iter().copied().collect();
        // The channel itself stays, even when empty: its key must
        // remain stable for future joins.
        Some((channel_name, remaining))
    }

    pub async fn channel_key_of(&self, name: &str) -> Option<[u8; KEY_LEN]> {
        let channels = self.channels.read().await;
        channels.get(name).map(|ch| *ch.key)
    }

    pub async fn members_of(&self, name: &str) -> Vec<ConnId> {
        let channels = self.channels.read().await;
        channels
            .get(name)
            .map(|ch| ch.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Usernames of a channel's members, for user_list replies.
    pub async fn member_usernames(&self, name: &str) -> Vec<String> {
        let channels = self.channels.read().await;
        let Some(channel) = channels.get(name) else {
            return Vec::new();
        };
        channel
            .members
            .iter()
            .filter_map(|cid| self.connections.get(cid).map(|c| c.username.clone()))
            .collect()
    }

    /// Name and member count of every channel, sorted by name.
    pub async fn snapshot_list(&self) -> Vec<ChannelSummary> {
        let channels = self.channels.read().await;
        let mut list: Vec<ChannelSummary> = channels
            .iter()
            .map(|(name, ch)| ChannelSummary {
                name: name.clone(),
                user_count: ch.members.len(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Where a datagram from `src` should be forwarded: the announced
    /// endpoints of every other member of the sender's channel. Empty
    /// when the source is unknown, unauthenticated, or channel-less.
    /// Never includes `src` itself.
    pub async fn voice_targets(&self, src: SocketAddr) -> Vec<SocketAddr> {
        let Some(conn_id) = self.endpoint_to_conn.get(&src).map(|e| *e) else {
            return Vec::new();
        };

        let channel_name = match self.connections.get(&conn_id) {
            Some(conn) if conn.authenticated && !conn.current_channel.is_empty() => {
                conn.current_channel.clone()
            }
            _ => return Vec::new(),
        };

        let channels = self.channels.read().await;
        let Some(channel) = channels.get(&channel_name) else {
            return Vec::new();
        };

        channel
            .members
            .iter()
            .filter(|&&member| member != conn_id)
            .filter_map(|member| self.connections.get(member).and_then(|c| c.udp_endpoint))
            .filter(|&addr| addr != src)
            .collect()
    }

    /// Drop a connection record and its endpoint mapping. Channel
    /// departure and session teardown are the caller's job.
    pub fn remove_connection(&self, conn_id: ConnId) -> Option<ClientConn> {
        let (_, conn) = self.connections.remove(&conn_id)?;
        if let Some(endpoint) = conn.udp_endpoint {
            // Only clear the mapping if it still points at us; a
            // reconnect may have claimed the endpoint in the meantime.
            if self.endpoint_to_conn.get(&endpoint).map(|e| *e) == Some(conn_id) {
                self.endpoint_to_conn.remove(&endpoint);
            }
        }
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UserStore;

    fn make_state() -> ServerState {
        ServerState::new(UserStore::open_in_memory().unwrap(), 8889)
    }

    fn add_conn(state: &ServerState, username: &str, udp_port: u16) -> ConnId {
        let (tx, _rx) = mpsc::channel(1);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let conn_id = state.register_connection(peer, tx);
        let endpoint: SocketAddr = format!("127.0.0.1:{udp_port}").parse().unwrap();
        {
            let mut conn = state.connections.get_mut(&conn_id).unwrap();
            conn.authenticated = true;
            conn.username = username.into();
            conn.udp_endpoint = Some(endpoint);
        }
        state.endpoint_to_conn.insert(endpoint, conn_id);
        conn_id
    }

    #[tokio::test]
    async fn default_channels_exist_with_distinct_keys() {
        let state = make_state();
        let general = state.channel_key_of("General").await.unwrap();
        let gaming = state.channel_key_of("Gaming").await.unwrap();
        assert_ne!(general, gaming);
        assert!(state.channel_key_of("Nope").await.is_none());
    }

    #[tokio::test]
    async fn channel_key_stable_across_joins() {
        let state = make_state();
        let first = state.ensure_channel("Raid").await;
        let second = state.ensure_channel("Raid").await;
        assert_eq!(first, second);
        assert_eq!(state.channel_key_of("Raid").await, Some(first));
    }

    #[tokio::test]
    async fn join_reports_prior_members_only() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        let bob = add_conn(&state, "bob", 50002);

        let others = state.join_channel(alice, "General").await;
        assert!(others.is_empty());

        let others = state.join_channel(bob, "General").await;
        assert_eq!(others, vec![alice]);
    }

    #[tokio::test]
    async fn member_channel_fields_agree() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        state.join_channel(alice, "General").await;

        // Every member's current_channel names the channel it sits in.
        for cid in state.members_of("General").await {
            let conn = state.connections.get(&cid).unwrap();
            assert_eq!(conn.current_channel, "General");
        }
    }

    #[tokio::test]
    async fn rejoin_same_channel_keeps_single_membership() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);

        state.join_channel(alice, "General").await;
        state.leave_current_channel(alice).await;
        state.join_channel(alice, "General").await;

        assert_eq!(state.members_of("General").await, vec![alice]);
    }

    #[tokio::test]
    async fn connection_in_at_most_one_channel() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);

        state.join_channel(alice, "General").await;
        let left = state.leave_current_channel(alice).await;
        assert_eq!(left.unwrap().0, "General");
        state.join_channel(alice, "Gaming").await;

        assert!(state.members_of("General").await.is_empty());
        assert_eq!(state.members_of("Gaming").await, vec![alice]);
    }

    #[tokio::test]
    async fn leave_without_channel_is_noop() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        assert!(state.leave_current_channel(alice).await.is_none());
    }

    #[tokio::test]
    async fn empty_channel_survives_departure() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        let key_before = state.ensure_channel("Podcast").await;
        state.join_channel(alice, "Podcast").await;
        state.leave_current_channel(alice).await;

        assert_eq!(state.channel_key_of("Podcast").await, Some(key_before));
        assert!(state.members_of("Podcast").await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_sorted_with_counts() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        state.join_channel(alice, "General").await;

        let list = state.snapshot_list().await;
        let names: Vec<&str> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Gaming", "General"]);
        assert_eq!(list[1].user_count, 1);
        assert_eq!(list[0].user_count, 0);
    }

    #[tokio::test]
    async fn voice_targets_exclude_source() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        let bob = add_conn(&state, "bob", 50002);
        state.join_channel(alice, "General").await;
        state.join_channel(bob, "General").await;

        let src: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let targets = state.voice_targets(src).await;
        assert_eq!(targets, vec!["127.0.0.1:50002".parse().unwrap()]);
        assert!(!targets.contains(&src));
    }

    #[tokio::test]
    async fn voice_targets_empty_for_unknown_source() {
        let state = make_state();
        let src: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert!(state.voice_targets(src).await.is_empty());
    }

    #[tokio::test]
    async fn voice_targets_empty_outside_channel() {
        let state = make_state();
        add_conn(&state, "alice", 50001);
        let src: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        assert!(state.voice_targets(src).await.is_empty());
    }

    #[tokio::test]
    async fn voice_targets_empty_for_unauthenticated() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        state.join_channel(alice, "General").await;
        state.connections.get_mut(&alice).unwrap().authenticated = false;

        let src: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        assert!(state.voice_targets(src).await.is_empty());
    }

    #[tokio::test]
    async fn remove_connection_clears_endpoint() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        let endpoint: SocketAddr = "127.0.0.1:50001".parse().unwrap();

        assert!(state.endpoint_to_conn.contains_key(&endpoint));
        let conn = state.remove_connection(alice).unwrap();
        assert_eq!(conn.username, "alice");
        assert!(!state.endpoint_to_conn.contains_key(&endpoint));
        assert!(state.remove_connection(alice).is_none());
    }

    #[tokio::test]
    async fn remove_connection_keeps_reclaimed_endpoint() {
        let state = make_state();
        let alice = add_conn(&state, "alice", 50001);
        // A reconnect claims the same endpoint before the old record dies.
        let alice2 = add_conn(&state, "alice", 50001);

        state.remove_connection(alice);
        let endpoint: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        assert_eq!(state.endpoint_to_conn.get(&endpoint).map(|e| *e), Some(alice2));
    }
}
