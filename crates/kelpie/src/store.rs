//! Registries shared across an endpoint: secured sessions, proxy
//! security IDs, per-exchange local states, and the backward channel.
//!
//! These were once process-wide singletons; reifying them as fields lets
//! every endpoint (and every test) own a fresh world.

use std::sync::{Arc, OnceLock};

use kelpie_crypto::SecuredSession;

use crate::backward::BackwardChannel;
use crate::cache::{spawn_sweeper, ShardedCache};
use crate::config::EndpointConfig;
use crate::state::LocalState;

/// Secured sessions keyed `sender || receiver || proxy`.
///
/// When a proxy is present the sender component is blanked so both legs
/// of a proxied session resolve to the same entry.
pub(crate) struct SessionStorage {
    cache: Arc<ShardedCache<SecuredSession>>,
}

impl SessionStorage {
    pub(crate) fn new(ttl: std::time::Duration) -> Self {
        Self {
            cache: Arc::new(ShardedCache::new(ttl)),
        }
    }

    fn key(sender: &str, receiver: &str, proxy: &str) -> String {
        if proxy.is_empty() {
            format!("{sender}{receiver}")
        } else {
            format!("{receiver}{proxy}")
        }
    }

    pub(crate) fn set(&self, sender: &str, receiver: &str, proxy: &str, session: SecuredSession) {
        self.cache.set(&Self::key(sender, receiver, proxy), session);
    }

    pub(crate) fn get(&self, sender: &str, receiver: &str, proxy: &str) -> Option<SecuredSession> {
        self.cache.get(&Self::key(sender, receiver, proxy))
    }

    pub(crate) fn delete(&self, sender: &str, receiver: &str, proxy: &str) {
        self.cache.delete(&Self::key(sender, receiver, proxy));
    }

    #[allow(dead_code)]
    pub(crate) fn item_count(&self) -> usize {
        self.cache.item_count()
    }

    fn start_sweeper(&self) {
        spawn_sweeper(&self.cache);
    }
}

/// Random per-(proxy, local) IDs that disambiguate sessions sharing one
/// proxy hop.
pub(crate) struct ProxyIdStorage {
    cache: Arc<ShardedCache<u32>>,
}

impl ProxyIdStorage {
    pub(crate) fn new(ttl: std::time::Duration) -> Self {
        Self {
            cache: Arc::new(ShardedCache::new(ttl)),
        }
    }

    /// The ID for this (proxy, local) pair, assigning a fresh random one
    /// on first use.
    pub(crate) fn get_or_assign(&self, proxy: &str, local: &str) -> u32 {
        self.cache
            .load_or_store(&format!("{proxy}{local}"), rand::random)
    }

    /// The ID for this (proxy, local) pair, when one was assigned.
    pub(crate) fn get(&self, proxy: &str, local: &str) -> Option<u32> {
        self.cache.get(&format!("{proxy}{local}"))
    }

    fn start_sweeper(&self) {
        spawn_sweeper(&self.cache);
    }
}

/// Everything an exchange needs besides its socket.
pub(crate) struct Stores {
    pub(crate) config: EndpointConfig,
    pub(crate) sessions: SessionStorage,
    pub(crate) proxy_ids: ProxyIdStorage,
    pub(crate) local_states: Arc<ShardedCache<Arc<LocalState>>>,
    pub(crate) backward: BackwardChannel,
    sweepers: OnceLock<()>,
}

impl Stores {
    pub(crate) fn new(config: EndpointConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionStorage::new(config.session_ttl),
            proxy_ids: ProxyIdStorage::new(config.session_ttl),
            local_states: Arc::new(ShardedCache::new(config.state_ttl)),
            backward: BackwardChannel::new(),
            config,
            sweepers: OnceLock::new(),
        })
    }

    /// Start the background sweeps once; callers invoke this from inside
    /// the runtime.
    pub(crate) fn start_sweepers(&self) {
        self.sweepers.get_or_init(|| {
            self.sessions.start_sweeper();
            self.proxy_ids.start_sweeper();
            spawn_sweeper(&self.local_states);
        });
    }
}
