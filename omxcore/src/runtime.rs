//! The runtime: component factories, instantiation and the handle
//! registry.
//!
//! The runtime replaces the global type factory of the original design
//! with an explicit context: component kinds are registered by role name,
//! instances are spawned onto the tokio runtime and tracked in a registry
//! keyed by component id, which is also how tunnel traffic finds its peer
//! without ever holding a direct reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use omxil::{
    ComponentId, ComponentUuid, ComponentVersion, IlError, IlResult, SpecVersion, SPEC_VERSION,
};

use crate::component::{spawn_component_task, Component, ComponentInner, Core};
use crate::fsm::Fsm;
use crate::kernel::Kernel;
use crate::port::{ConfigPort, PortConfig};
use crate::processor::Processor;
use crate::servant::{Mailbox, Servant};
use crate::watchers::Watchers;

/// Host-tunable runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Mailbox capacity per component; overflow surfaces as
    /// `InsufficientResources`.
    pub mailbox_capacity: usize,
    /// How long `destroy` waits for a cancelled component task before
    /// aborting it.
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 128,
            shutdown_grace_ms: 2_000,
        }
    }
}

/// Plain-data identity of a component kind, the loadable half of a
/// [`ComponentDefinition`]: hosts keep lists of these in their
/// configuration files and bind the processor at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub role: String,
}

/// Everything needed to bring one component instance up.
pub struct ComponentDefinition {
    pub name: String,
    pub role: String,
    pub version: SpecVersion,
    pub uuid: ComponentUuid,
    pub ports: Vec<PortConfig>,
    pub processor: Box<dyn Processor>,
}

impl ComponentDefinition {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        processor: Box<dyn Processor>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            version: SPEC_VERSION,
            uuid: [0; 16],
            ports: Vec::new(),
            processor,
        }
    }

    /// Builds a definition from its loadable identity.
    pub fn from_info(info: ComponentInfo, processor: Box<dyn Processor>) -> Self {
        Self::new(info.name, info.role, processor)
    }

    pub fn with_port(mut self, port: PortConfig) -> Self {
        self.ports.push(port);
        self
    }
}

type ComponentFactory = Box<dyn Fn() -> ComponentDefinition + Send + Sync>;

pub(crate) struct RuntimeShared {
    config: RuntimeConfig,
    components: RwLock<HashMap<ComponentId, Weak<ComponentInner>>>,
    factories: RwLock<HashMap<String, ComponentFactory>>,
    next_id: AtomicU64,
}

impl RuntimeShared {
    pub(crate) fn lookup(&self, id: ComponentId) -> Option<Component> {
        let components = self.components.read().expect("registry poisoned");
        components
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| Component { inner })
    }
}

/// An IL runtime context. Cheap to clone; all clones share the registry.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                config,
                components: RwLock::new(HashMap::new()),
                factories: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a component kind under its role name.
    pub fn register_role(
        &self,
        role: impl Into<String>,
        factory: impl Fn() -> ComponentDefinition + Send + Sync + 'static,
    ) {
        self.shared
            .factories
            .write()
            .expect("registry poisoned")
            .insert(role.into(), Box::new(factory));
    }

    /// The `GetHandle` equivalent: builds and spawns an instance of a
    /// registered component kind. The new component starts in Loaded.
    pub fn instantiate(&self, role: &str) -> IlResult<Component> {
        let def = {
            let factories = self.shared.factories.read().expect("registry poisoned");
            let factory = factories.get(role).ok_or(IlError::ComponentNotFound)?;
            factory()
        };
        Ok(self.spawn_component(def))
    }

    /// Spawns a component from an explicit definition. Must run within a
    /// tokio runtime; the component task and its watchers live there.
    pub fn spawn_component(&self, def: ComponentDefinition) -> Component {
        let id = ComponentId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mailbox = Arc::new(Mailbox::new(self.shared.config.mailbox_capacity));
        let cancel = CancellationToken::new();

        let cport = ConfigPort::new(
            ComponentVersion {
                name: def.name.clone(),
                component_version: def.version,
                spec_version: SPEC_VERSION,
                uuid: def.uuid,
            },
            def.role,
        );
        let mut kernel = Kernel::new(cport);
        for port in def.ports {
            kernel.register_port(port);
        }

        let core = Core {
            kernel,
            fsm: Fsm::new(),
            servant: Servant::new(id, def.name.clone()),
            watchers: Watchers::new(Arc::clone(&mailbox), cancel.child_token()),
            processor: def.processor,
            transition_steps_done: true,
        };

        let inner = Arc::new(ComponentInner {
            id,
            name: def.name,
            mailbox,
            core: Mutex::new(core),
            cancel,
            callbacks: StdMutex::new(None),
            runtime: Arc::downgrade(&self.shared),
            task: StdMutex::new(None),
        });
        self.shared
            .components
            .write()
            .expect("registry poisoned")
            .insert(id, Arc::downgrade(&inner));

        let task = spawn_component_task(Arc::clone(&inner));
        *inner.task.lock().expect("task slot poisoned") = Some(task);

        debug!(component = %inner.name, %id, "component spawned");
        Component { inner }
    }

    /// Tears down every live component concurrently.
    pub async fn shutdown(&self) {
        let components: Vec<Component> = {
            let registry = self.shared.components.read().expect("registry poisoned");
            registry
                .values()
                .filter_map(Weak::upgrade)
                .map(|inner| Component { inner })
                .collect()
        };
        futures_util::future::join_all(
            components.iter().map(|component| self.destroy(component)),
        )
        .await;
    }

    /// The `FreeHandle` equivalent: stops the component task and drops it
    /// from the registry. A task that ignores cancellation past the
    /// configured grace period is aborted. The handle stays valid but
    /// dead.
    pub async fn destroy(&self, component: &Component) -> IlResult<()> {
        let id = component.id();
        component.inner.cancel.cancel();
        let task = component
            .inner
            .task
            .lock()
            .expect("task slot poisoned")
            .take();
        if let Some(mut task) = task {
            let grace = std::time::Duration::from_millis(self.shared.config.shutdown_grace_ms);
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(%id, "component task ended abnormally"),
                Err(_) => {
                    warn!(%id, grace_ms = self.shared.config.shutdown_grace_ms,
                          "component task ignored cancellation, aborting");
                    task.abort();
                }
            }
        }
        self.shared
            .components
            .write()
            .expect("registry poisoned")
            .remove(&id);
        debug!(%id, "component destroyed");
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NullProcessor;
    use omxil::State;

    #[tokio::test]
    async fn test_instantiate_registered_role() {
        let rt = Runtime::default();
        rt.register_role("audio_processor.null", || {
            ComponentDefinition::new("null.component", "audio_processor.null", Box::new(NullProcessor))
        });

        let comp = rt.instantiate("audio_processor.null").unwrap();
        assert_eq!(comp.get_state().await, State::Loaded);
        assert_eq!(
            comp.get_component_version().await.name,
            "null.component"
        );
        let info = comp.info().await;
        assert_eq!(info.name, "null.component");
        assert_eq!(info.role, "audio_processor.null");
        rt.destroy(&comp).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let rt = Runtime::default();
        assert!(matches!(
            rt.instantiate("no.such.role"),
            Err(IlError::ComponentNotFound)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let rt = Runtime::default();
        let c1 = rt.spawn_component(ComponentDefinition::new(
            "one",
            "audio_processor.null",
            Box::new(NullProcessor),
        ));
        let c2 = rt.spawn_component(ComponentDefinition::new(
            "two",
            "audio_processor.null",
            Box::new(NullProcessor),
        ));
        rt.shutdown().await;
        // Idempotent: the components are already gone.
        rt.destroy(&c1).await.unwrap();
        rt.destroy(&c2).await.unwrap();
    }

    #[test]
    fn test_runtime_config_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mailbox_capacity, 128);
        assert_eq!(cfg.shutdown_grace_ms, 2_000);
    }

    #[test]
    fn test_component_info_builds_a_definition() {
        let info: ComponentInfo =
            serde_json::from_str(r#"{"name":"pcm.sink","role":"audio_renderer.pcm"}"#).unwrap();
        let def = ComponentDefinition::from_info(info, Box::new(NullProcessor));
        assert_eq!(def.name, "pcm.sink");
        assert_eq!(def.role, "audio_renderer.pcm");
    }
}
