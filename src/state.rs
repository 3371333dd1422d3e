//! Shared application state.

use crate::backend::BackendRegistry;
use crate::config::{Config, ConfigError};
use crate::metrics::{EventSink, LbEvent};
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owned, swappable reference to the live backend registry.
///
/// Cloning shares the same slot. Readers take a cheap snapshot with
/// [`load`](Self::load) and keep using it even if a swap happens meanwhile.
#[derive(Debug, Clone)]
pub struct RegistryHandle(Arc<ArcSwap<BackendRegistry>>);

impl RegistryHandle {
    pub fn new(registry: BackendRegistry) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(registry)))
    }

    /// Current registry.
    pub fn load(&self) -> Arc<BackendRegistry> {
        self.0.load_full()
    }

    /// Replace the registry, returning the previous one.
    pub fn swap(&self, registry: BackendRegistry) -> Arc<BackendRegistry> {
        self.0.swap(Arc::new(registry))
    }
}

/// State shared by the listener, the probe, and the reload watcher.
#[derive(Clone)]
pub struct LbState {
    /// Last applied configuration.
    config: Arc<ArcSwap<Config>>,
    registry: RegistryHandle,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
}

impl LbState {
    /// Build state from a validated configuration.
    pub fn new(config: Config, events: Arc<dyn EventSink>) -> Result<Self, ConfigError> {
        let registry = BackendRegistry::new(&config.backends)?;
        events.emit(&LbEvent::Reconfigured {
            backends: registry.len(),
        });
        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry: RegistryHandle::new(registry),
            events,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Replace the backend pool.
    ///
    /// On error the running registry is untouched. Backends whose URL is in
    /// both pools keep their health status; load always starts from zero.
    pub fn reconfigure<I, S>(&self, addresses: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = BackendRegistry::new(addresses)?;
        next.inherit_health(&self.registry.load());
        let backends = next.len();
        self.registry.swap(next);
        self.events.emit(&LbEvent::Reconfigured { backends });
        Ok(())
    }

    /// Apply a reloaded configuration.
    ///
    /// Only the backend list takes effect; everything else needs a restart
    /// and is reported as ignored. The stored config keeps the values that
    /// are actually running, and an unchanged backend list leaves the
    /// registry and its load counters alone.
    pub fn apply_config(&self, config: Config) -> Result<(), ConfigError> {
        let current = self.config();

        if config.listen != current.listen {
            warn!(
                current = %current.listen,
                requested = %config.listen,
                "listen address change requires a restart, ignoring"
            );
        }
        if config.strategy != current.strategy {
            warn!(
                current = ?current.strategy,
                requested = ?config.strategy,
                "strategy change requires a restart, ignoring"
            );
        }
        if config.global != current.global || config.health_check != current.health_check {
            warn!("global and health_check changes require a restart, ignoring");
        }

        if config.backends == current.backends {
            debug!("backend list unchanged, keeping registry");
            return Ok(());
        }

        self.reconfigure(&config.backends)?;
        self.config.store(Arc::new(Config {
            backends: config.backends,
            ..Config::clone(&current)
        }));
        Ok(())
    }
}
