use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::ConfigReader;
use crate::error::GustError;
use crate::provider::store::{ProviderStore, RegistrySnapshot};
use crate::provider::{ProviderConfig, ProviderRole};

const EVENT_CAPACITY: usize = 32;

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// The active provider for `role` changed or its record was updated.
    ActiveChanged {
        role: ProviderRole,
        provider: Option<ProviderConfig>,
    },
    /// The set of stored providers changed.
    ProvidersChanged,
}

/// A stored provider with the roles it is currently active for.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub provider: ProviderConfig,
    pub active_for: Vec<ProviderRole>,
}

/// Named provider configurations plus one active pointer per role.
///
/// Reads take the lock briefly and hand back clones; callers never hold the
/// lock across a network call. Every mutation is written through to the
/// `ProviderStore`; a failed write is logged and does not fail the operation.
/// Snapshots are numbered under the write lock and a snapshot older than the
/// last one saved is never written, so concurrent mutations cannot leave a
/// stale file behind.
pub struct ProviderRegistry {
    inner: Arc<RwLock<Inner>>,
    store: Arc<dyn ProviderStore>,
    /// Generation of the last snapshot handed to the store.
    saved: Mutex<u64>,
    config: Arc<dyn ConfigReader>,
    events: broadcast::Sender<RegistryEvent>,
}

struct Inner {
    providers: BTreeMap<String, ProviderConfig>,
    active: BTreeMap<ProviderRole, String>,
    generation: u64,
}

/// State to persist, taken while the mutation still holds the write lock.
struct Pending {
    generation: u64,
    snapshot: RegistrySnapshot,
}

impl Inner {
    /// Bump the generation and capture the state it names.
    fn commit(&mut self) -> Pending {
        self.generation += 1;
        Pending {
            generation: self.generation,
            snapshot: RegistrySnapshot {
                providers: self.providers.clone(),
                active_chat: self.active.get(&ProviderRole::Chat).cloned(),
                active_fim: self.active.get(&ProviderRole::Fim).cloned(),
            },
        }
    }

    fn active_provider(&self, role: ProviderRole) -> Option<ProviderConfig> {
        self.active
            .get(&role)
            .and_then(|id| self.providers.get(id))
            .cloned()
    }

    fn insert_new(&mut self, mut config: ProviderConfig) -> ProviderConfig {
        config.id = uuid::Uuid::new_v4().to_string();
        self.providers.insert(config.id.clone(), config.clone());
        config
    }

    fn seed_defaults(&mut self, config: &crate::config::Config) -> (ProviderConfig, ProviderConfig) {
        let chat = self.insert_new(ProviderConfig::default_chat(config));
        let fim = self.insert_new(ProviderConfig::default_fim(config));
        self.active.insert(ProviderRole::Chat, chat.id.clone());
        self.active.insert(ProviderRole::Fim, fim.id.clone());
        (chat, fim)
    }
}

impl ProviderRegistry {
    /// Load the registry from `store`. An empty store is seeded with one
    /// default provider per role, each active for its role.
    pub fn open(store: Arc<dyn ProviderStore>, config: Arc<dyn ConfigReader>) -> Self {
        let snapshot = store.load().unwrap_or_else(|e| {
            tracing::warn!("provider store unreadable, starting empty: {e}");
            RegistrySnapshot::default()
        });

        let mut active = BTreeMap::new();
        for (role, id) in [
            (ProviderRole::Chat, snapshot.active_chat),
            (ProviderRole::Fim, snapshot.active_fim),
        ] {
            match id {
                Some(id) if snapshot.providers.contains_key(&id) => {
                    active.insert(role, id);
                }
                Some(id) => tracing::warn!(role = role.as_str(), %id, "dropping dangling active pointer"),
                None => {}
            }
        }

        let mut inner = Inner {
            providers: snapshot.providers,
            active,
            generation: 0,
        };

        let seeded = if inner.providers.is_empty() {
            let (chat, fim) = inner.seed_defaults(&config.current());
            tracing::info!(chat = %chat.id, fim = %fim.id, "seeded default providers");
            Some(inner.commit())
        } else {
            None
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Self {
            inner: Arc::new(RwLock::new(inner)),
            store,
            saved: Mutex::new(0),
            config,
            events,
        };
        if let Some(pending) = seeded {
            registry.persist(pending);
        }
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get_active(&self, role: ProviderRole) -> Option<ProviderConfig> {
        self.read().active_provider(role)
    }

    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.read().providers.get(id).cloned()
    }

    /// Mark `id` active for `role`. Unknown ids are ignored.
    pub fn set_active(&self, role: ProviderRole, id: &str) {
        let (provider, pending) = {
            let mut inner = self.write();
            let Some(provider) = inner.providers.get(id).cloned() else {
                tracing::debug!(role = role.as_str(), %id, "set_active ignored: unknown provider");
                return;
            };
            inner.active.insert(role, id.to_string());
            (provider, inner.commit())
        };
        tracing::info!(role = role.as_str(), id = %provider.id, label = %provider.label, "active provider changed");
        self.persist(pending);
        self.publish(RegistryEvent::ActiveChanged {
            role,
            provider: Some(provider),
        });
    }

    /// Insert `config` under a fresh id and return the stored record.
    pub fn add(&self, config: ProviderConfig) -> ProviderConfig {
        let (stored, pending) = {
            let mut inner = self.write();
            let stored = inner.insert_new(config);
            (stored, inner.commit())
        };
        tracing::info!(id = %stored.id, label = %stored.label, "provider added");
        self.persist(pending);
        self.publish(RegistryEvent::ProvidersChanged);
        stored
    }

    /// Replace the record with the same id. If it is active for a role, the
    /// active-provider notification fires again for that role.
    pub fn update(&self, config: ProviderConfig) -> Result<ProviderConfig, GustError> {
        let (roles, pending) = {
            let mut inner = self.write();
            if !inner.providers.contains_key(&config.id) {
                return Err(GustError::ProviderNotFound(config.id));
            }
            inner.providers.insert(config.id.clone(), config.clone());
            let roles: Vec<ProviderRole> = inner
                .active
                .iter()
                .filter(|(_, id)| **id == config.id)
                .map(|(role, _)| *role)
                .collect();
            (roles, inner.commit())
        };
        self.persist(pending);
        for role in roles {
            self.publish(RegistryEvent::ActiveChanged {
                role,
                provider: Some(config.clone()),
            });
        }
        self.publish(RegistryEvent::ProvidersChanged);
        Ok(config)
    }

    /// Delete a record. Active pointers referring to it are cleared, not
    /// reassigned.
    pub fn remove(&self, id: &str) -> Option<ProviderConfig> {
        let (removed, cleared, pending) = {
            let mut inner = self.write();
            let removed = inner.providers.remove(id)?;
            let cleared: Vec<ProviderRole> = inner
                .active
                .iter()
                .filter(|(_, active)| active.as_str() == id)
                .map(|(role, _)| *role)
                .collect();
            for role in &cleared {
                inner.active.remove(role);
            }
            (removed, cleared, inner.commit())
        };
        tracing::info!(%id, label = %removed.label, "provider removed");
        self.persist(pending);
        for role in cleared {
            self.publish(RegistryEvent::ActiveChanged {
                role,
                provider: None,
            });
        }
        self.publish(RegistryEvent::ProvidersChanged);
        Some(removed)
    }

    /// Duplicate a record under a new id with a `-copy` label suffix.
    pub fn copy(&self, id: &str) -> Option<ProviderConfig> {
        let mut duplicate = self.get(id)?;
        duplicate.label = format!("{}-copy", duplicate.label);
        Some(self.add(duplicate))
    }

    /// Drop every record and reseed the two defaults, both active.
    pub fn reset_to_defaults(&self) {
        let config = self.config.current();
        let (chat, fim, pending) = {
            let mut inner = self.write();
            inner.providers.clear();
            inner.active.clear();
            let (chat, fim) = inner.seed_defaults(&config);
            (chat, fim, inner.commit())
        };
        tracing::info!("providers reset to defaults");
        self.persist(pending);
        self.publish(RegistryEvent::ActiveChanged {
            role: ProviderRole::Chat,
            provider: Some(chat),
        });
        self.publish(RegistryEvent::ActiveChanged {
            role: ProviderRole::Fim,
            provider: Some(fim),
        });
        self.publish(RegistryEvent::ProvidersChanged);
    }

    /// All records with their active roles, ordered by label then id.
    pub fn list(&self) -> Vec<ProviderEntry> {
        let inner = self.read();
        let mut entries: Vec<ProviderEntry> = inner
            .providers
            .values()
            .map(|p| ProviderEntry {
                provider: p.clone(),
                active_for: inner
                    .active
                    .iter()
                    .filter(|(_, id)| **id == p.id)
                    .map(|(role, _)| *role)
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.provider
                .label
                .cmp(&b.provider.label)
                .then_with(|| a.provider.id.cmp(&b.provider.id))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, pending: Pending) {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.generation <= *saved {
            tracing::debug!(generation = pending.generation, "skipping superseded registry snapshot");
            return;
        }
        // Claimed even if the write fails: an older snapshot must never follow.
        *saved = pending.generation;
        let result = match tokio::runtime::Handle::try_current() {
            Ok(rt) if rt.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.store.save(&pending.snapshot))
            }
            _ => self.store.save(&pending.snapshot),
        };
        if let Err(e) = result {
            tracing::warn!("failed to persist providers: {e}");
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("ProviderRegistry")
            .field("count", &inner.providers.len())
            .field("active", &inner.active)
            .finish()
    }
}
