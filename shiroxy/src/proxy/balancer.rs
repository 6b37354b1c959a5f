//! Tag-aware load balancing
//!
//! Selection resolves the tag through the LRU cache, then the trie, then
//! falls through to the anonymous group holding every server (unless the
//! strict tag rule is on). Within a group the configured policy picks the
//! server: round-robin scanning for the first alive member,
//! least-connections with ties broken by lowest index, or sticky-session
//! keyed by client IP. A request is never dispatched to a server whose
//! alive bit is down at selection time.

use crate::config::{
    BackendServerConfig, BalancePolicy, Config, NoServerAction, TagRule,
};
use crate::error::{Result, ShiroxyError};
use common::{TagCache, TagTrie, DEFAULT_TAG_CACHE_CAPACITY};
use http::Uri;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Transport failures are retried on another server at most this many
/// times per request.
pub const MAX_RETRIES: usize = 3;

/// A backend server. The balancer and the health checker hold non-owning
/// references and coordinate through the atomics.
#[derive(Debug)]
pub struct Server {
    pub id: String,
    /// Scheme + host + port the engine rewrites requests onto.
    pub url: Uri,
    pub health_check_url: Uri,
    pub tags: Vec<String>,
    alive: AtomicBool,
    first_probe_pending: AtomicBool,
}

impl Server {
    pub fn new(id: String, url: &str, health_check_url: &str, tags: Vec<String>) -> Result<Self> {
        if id.is_empty() {
            return Err(ShiroxyError::InvalidArgument("server id is empty".into()));
        }
        let url: Uri = url
            .parse()
            .map_err(|e| ShiroxyError::InvalidArgument(format!("server {id} url: {e}")))?;
        if url.scheme().is_none() || url.authority().is_none() {
            return Err(ShiroxyError::InvalidArgument(format!(
                "server {id} url must carry scheme and host"
            )));
        }
        let health_check_url: Uri = health_check_url.parse().map_err(|e| {
            ShiroxyError::InvalidArgument(format!("server {id} health_check_url: {e}"))
        })?;
        if health_check_url.scheme().is_none() || health_check_url.authority().is_none() {
            return Err(ShiroxyError::InvalidArgument(format!(
                "server {id} health_check_url must carry scheme and host"
            )));
        }

        Ok(Self {
            id,
            url,
            health_check_url,
            tags: tags.into_iter().filter(|t| !t.is_empty()).collect(),
            alive: AtomicBool::new(false),
            first_probe_pending: AtomicBool::new(true),
        })
    }

    pub fn from_config(config: &BackendServerConfig, scheme: &str) -> Result<Self> {
        let url = format!("{scheme}://{}:{}", config.host, config.port);
        Self::new(
            config.id.clone(),
            &url,
            &config.health_url,
            config.tags.clone(),
        )
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Clears the first-probe flag, returning whether it was still set.
    /// Used to emit the one-time registration event.
    pub fn take_first_probe(&self) -> bool {
        self.first_probe_pending.swap(false, Ordering::AcqRel)
    }

    pub fn first_probe_pending(&self) -> bool {
        self.first_probe_pending.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            url: self.url.to_string(),
            health_check_url: self.health_check_url.to_string(),
            alive: self.is_alive(),
            tags: self.tags.clone(),
        }
    }
}

/// Serializable view of a server for the admin surface. Carries no
/// internal handles.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub url: String,
    pub health_check_url: String,
    pub alive: bool,
    pub tags: Vec<String>,
}

#[derive(Default)]
struct TagRoutingState {
    cursor: usize,
    conn_count: HashMap<String, usize>,
    sticky: HashMap<String, String>,
}

struct Inner {
    servers: Vec<Arc<Server>>,
    by_tag: HashMap<String, Vec<Arc<Server>>>,
    routing: HashMap<String, TagRoutingState>,
    cache: TagCache<Vec<Arc<Server>>>,
    trie: TagTrie<Vec<Arc<Server>>>,
}

pub struct LoadBalancer {
    policy: BalancePolicy,
    tag_rule: TagRule,
    no_server_action: NoServerAction,
    inner: RwLock<Inner>,
}

impl LoadBalancer {
    pub fn new(
        policy: BalancePolicy,
        tag_rule: TagRule,
        no_server_action: NoServerAction,
        servers: Vec<Server>,
    ) -> Self {
        let mut inner = Inner {
            servers: servers.into_iter().map(Arc::new).collect(),
            by_tag: HashMap::new(),
            routing: HashMap::new(),
            cache: TagCache::new(DEFAULT_TAG_CACHE_CAPACITY),
            trie: TagTrie::new(),
        };
        inner.routing.insert(String::new(), TagRoutingState::default());
        Self::rebuild_locked(&mut inner);

        Self {
            policy,
            tag_rule,
            no_server_action,
            inner: RwLock::new(inner),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let scheme = config.frontend.mode.scheme();
        let servers = config
            .backend
            .servers
            .iter()
            .map(|s| Server::from_config(s, scheme))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(
            config.backend.balance,
            config.backend.tag_rule,
            config.backend.no_server_action,
            servers,
        ))
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    /// Pick a server for the request. `tag` is the routing tag from the
    /// domain metadata; empty means the anonymous group.
    pub fn select(&self, client_ip: &str, tag: &str) -> Result<Arc<Server>> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;

        let (group, routing_key) = if !tag.is_empty() {
            if let Some(group) = inner.cache.get(tag) {
                (group, tag.to_string())
            } else if let Some(group) = inner.trie.search(tag) {
                inner.cache.set(tag, group.clone());
                (group, tag.to_string())
            } else if self.tag_rule == TagRule::Strict {
                return Err(ShiroxyError::NoServers(tag.to_string()));
            } else {
                (inner.servers.clone(), String::new())
            }
        } else if self.tag_rule == TagRule::Strict {
            // Strict mode refuses the anonymous group outright, so a
            // request without a tag has nowhere to go.
            return Err(ShiroxyError::NoServers(String::new()));
        } else {
            (inner.servers.clone(), String::new())
        };

        if group.is_empty() {
            return Err(ShiroxyError::NoServers(routing_key));
        }

        let state = inner.routing.entry(routing_key.clone()).or_default();
        let server = match self.policy {
            BalancePolicy::RoundRobin => Self::round_robin(state, &group, self.no_server_action),
            BalancePolicy::LeastConnections => {
                Self::least_connections(state, &group, self.no_server_action)
            }
            BalancePolicy::StickySession => {
                Self::sticky_session(state, &group, client_ip, self.no_server_action)
            }
        }
        .ok_or(ShiroxyError::NoServers(routing_key))?;

        *state.conn_count.entry(server.id.clone()).or_insert(0) += 1;
        Ok(server)
    }

    /// Decrement the connection count at request completion.
    pub fn release(&self, tag: &str, server_id: &str) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let key = if !tag.is_empty() && inner.by_tag.contains_key(tag) {
            tag
        } else {
            ""
        };
        if let Some(state) = inner.routing.get_mut(key) {
            if let Some(count) = state.conn_count.get_mut(server_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Mark a server dead after a transport failure. A probe pass brings
    /// it back.
    pub fn mark_dead(&self, server_id: &str) {
        let inner = self.inner.read().unwrap();
        if let Some(server) = inner.servers.iter().find(|s| s.id == server_id) {
            server.set_alive(false);
            warn!(server = %server_id, "Marked server dead after transport failure");
        }
    }

    /// Snapshot of the current server list.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.inner.read().unwrap().servers.clone()
    }

    pub fn server_infos(&self) -> Vec<ServerInfo> {
        self.inner
            .read()
            .unwrap()
            .servers
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Admin: add a server and rebuild the tag index.
    pub fn register_server(&self, server: Server) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.servers.iter().any(|s| s.id == server.id) {
            return Err(ShiroxyError::InvalidArgument(format!(
                "server {} is already registered",
                server.id
            )));
        }
        info!(server = %server.id, url = %server.url, "Registered backend server");
        inner.servers.push(Arc::new(server));
        Self::rebuild_locked(&mut inner);
        Ok(())
    }

    /// Admin: remove a server and rebuild the tag index.
    pub fn remove_server(&self, server_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.servers.len();
        inner.servers.retain(|s| s.id != server_id);
        if inner.servers.len() == before {
            return Err(ShiroxyError::NotFound(format!("server {server_id}")));
        }
        info!(server = %server_id, "Removed backend server");
        Self::rebuild_locked(&mut inner);
        Ok(())
    }

    /// Re-derive the tag groups, cache, and trie from the authoritative
    /// server list. Called on any server add/remove or tag change.
    fn rebuild_locked(inner: &mut Inner) {
        inner.by_tag.clear();
        for server in &inner.servers {
            for tag in &server.tags {
                inner
                    .by_tag
                    .entry(tag.clone())
                    .or_default()
                    .push(Arc::clone(server));
            }
        }

        inner.cache.clear();
        inner.trie.clear();
        for (tag, group) in &inner.by_tag {
            inner.trie.insert(tag, group.clone());
            inner.cache.set(tag, group.clone());
        }

        let Inner {
            by_tag, routing, ..
        } = inner;
        routing.retain(|tag, _| tag.is_empty() || by_tag.contains_key(tag));
    }

    fn round_robin(
        state: &mut TagRoutingState,
        group: &[Arc<Server>],
        action: NoServerAction,
    ) -> Option<Arc<Server>> {
        let len = group.len();
        for _ in 0..len {
            let idx = state.cursor % len;
            state.cursor = (state.cursor + 1) % len;
            if group[idx].is_alive() {
                return Some(Arc::clone(&group[idx]));
            }
        }

        // Every member is dead; loose mode fails open on the next slot.
        if action == NoServerAction::Loose {
            let idx = state.cursor % len;
            state.cursor = (state.cursor + 1) % len;
            return Some(Arc::clone(&group[idx]));
        }
        None
    }

    fn least_connections(
        state: &mut TagRoutingState,
        group: &[Arc<Server>],
        action: NoServerAction,
    ) -> Option<Arc<Server>> {
        let pick = |require_alive: bool, state: &TagRoutingState| -> Option<usize> {
            let mut best: Option<(usize, usize)> = None;
            for (idx, server) in group.iter().enumerate() {
                if require_alive && !server.is_alive() {
                    continue;
                }
                let count = state.conn_count.get(&server.id).copied().unwrap_or(0);
                // Strict less-than keeps ties on the lowest index.
                if best.map_or(true, |(best_count, _)| count < best_count) {
                    best = Some((count, idx));
                }
            }
            best.map(|(_, idx)| idx)
        };

        let idx = pick(true, state).or_else(|| {
            if action == NoServerAction::Loose {
                pick(false, state)
            } else {
                None
            }
        })?;
        Some(Arc::clone(&group[idx]))
    }

    fn sticky_session(
        state: &mut TagRoutingState,
        group: &[Arc<Server>],
        client_ip: &str,
        action: NoServerAction,
    ) -> Option<Arc<Server>> {
        if let Some(id) = state.sticky.get(client_ip).cloned() {
            match group.iter().find(|s| s.id == id) {
                Some(server) if server.is_alive() => return Some(Arc::clone(server)),
                Some(_) => {}
                // Server left the group; purge the stale mapping lazily.
                None => {
                    state.sticky.remove(client_ip);
                }
            }
        }

        let chosen = Self::round_robin(state, group, action)?;
        state.sticky.insert(client_ip.to_string(), chosen.id.clone());
        Some(chosen)
    }

    #[cfg(test)]
    fn set_conn_count(&self, tag: &str, server_id: &str, count: usize) {
        let mut inner = self.inner.write().unwrap();
        inner
            .routing
            .entry(tag.to_string())
            .or_default()
            .conn_count
            .insert(server_id.to_string(), count);
    }

    #[cfg(test)]
    fn conn_count(&self, tag: &str, server_id: &str) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .routing
            .get(tag)
            .and_then(|state| state.conn_count.get(server_id))
            .copied()
            .unwrap_or(0)
    }
}
