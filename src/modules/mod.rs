//! Module contract and registry.
//!
//! A module is a self-contained test routine that runs against a
//! [`Session`] on the engine's worker task and emits
//! [`MeasurementRecord`]s as it goes. Modules never spawn or join anything
//! themselves; the engine hands them a [`RecordSink`] and the sink carries
//! both the emit path and the stop signal.
//!
//! Modules are not constructed by callers. A [`ModuleDescriptor`] carries
//! the metadata plus a factory, and the engine instantiates the module when
//! a run starts so the busy transition and construction happen together.
//!
//! # Writing a module
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct Flip;
//!
//! #[async_trait]
//! impl Module for Flip {
//!     fn default_config(&self) -> ModuleConfig {
//!         options(json!({ "amplitude": 2.0 }))
//!     }
//!
//!     async fn run(&self, session: &mut Session, devices: &[Coordinate],
//!                  config: &ModuleConfig, sink: &mut dyn RecordSink) -> ArcResult<()> {
//!         for &device in devices {
//!             if sink.should_stop() { break; }
//!             let record = session.read_one(device).await?;
//!             sink.emit(record).await?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod engine;
pub mod readops;
pub mod sequence;

pub use engine::{ModuleRun, HANDOFF_CAPACITY};
pub use readops::{ReadAll, ReadMasked, Retention};
pub use sequence::{Sequence, SequenceEvent};

use crate::error::{ArcError, ArcResult};
use crate::instrument::crossbar::{Coordinate, Geometry};
use crate::instrument::session::Session;
use crate::measurement::MeasurementRecord;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Option name to value.
pub type ModuleConfig = serde_json::Map<String, Value>;

/// Build a [`ModuleConfig`] from a JSON object literal. Anything other than
/// an object yields an empty config.
pub fn options(value: Value) -> ModuleConfig {
    match value {
        Value::Object(map) => map,
        _ => ModuleConfig::new(),
    }
}

/// Where a running module sends its records.
#[async_trait]
pub trait RecordSink: Send {
    /// Hand one record to the consumer. Suspends while the handoff buffer is
    /// full. Fails with [`ArcError::Cancelled`] once the run is stopped.
    async fn emit(&mut self, record: MeasurementRecord) -> ArcResult<()>;

    /// True once the consumer has cancelled or abandoned the run.
    fn should_stop(&self) -> bool;

    /// Sleep for `period`, waking early if the run is stopped. Returns
    /// `false` when it was.
    async fn idle(&mut self, period: Duration) -> bool;
}

/// A test routine runnable by the engine.
#[async_trait]
pub trait Module: Send + Sync {
    /// Every option the module accepts, with its default value.
    fn default_config(&self) -> ModuleConfig;

    /// Check the resolved configuration and device list before the worker
    /// starts. Device coordinates are already bounds-checked.
    fn validate(
        &self,
        _config: &ModuleConfig,
        _devices: &[Coordinate],
        _geometry: Geometry,
    ) -> ArcResult<()> {
        Ok(())
    }

    /// Run to completion or until `sink.should_stop()`.
    ///
    /// Implementations must check the stop signal between logical steps.
    async fn run(
        &self,
        session: &mut Session,
        devices: &[Coordinate],
        config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()>;
}

/// Factory for modules that have a `Default` instance.
pub fn boxed<M: Module + Default + 'static>() -> Box<dyn Module> {
    Box::new(M::default())
}

/// Deserialize a resolved config into a typed struct.
pub fn parse_config<T: DeserializeOwned>(config: &ModuleConfig) -> ArcResult<T> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| ArcError::invalid(format!("bad module option: {}", e)))
}

/// Metadata and factory for a module.
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    /// Human-readable name.
    pub name: &'static str,
    /// Short unique tag used for lookup.
    pub tag: &'static str,
    /// One-line description.
    pub description: &'static str,
    factory: fn() -> Box<dyn Module>,
}

impl ModuleDescriptor {
    /// Describe a module.
    pub const fn new(
        name: &'static str,
        tag: &'static str,
        description: &'static str,
        factory: fn() -> Box<dyn Module>,
    ) -> Self {
        Self {
            name,
            tag,
            description,
            factory,
        }
    }

    /// Construct a fresh instance.
    pub fn instantiate(&self) -> Box<dyn Module> {
        (self.factory)()
    }

    /// Overlay `overrides` on the module defaults. Unknown option names are
    /// rejected.
    pub fn resolve(&self, module: &dyn Module, overrides: &ModuleConfig) -> ArcResult<ModuleConfig> {
        let mut config = module.default_config();
        for (key, value) in overrides {
            if !config.contains_key(key) {
                return Err(ArcError::invalid(format!(
                    "module {} has no option '{}'",
                    self.tag, key
                )));
            }
            config.insert(key.clone(), value.clone());
        }
        Ok(config)
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Modules known by tag.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<&'static str, ModuleDescriptor>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the modules shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ReadAll::DESCRIPTOR);
        registry.register(ReadMasked::DESCRIPTOR);
        registry.register(Retention::DESCRIPTOR);
        registry
    }

    /// Add a module, returning the one previously registered under its tag.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Option<ModuleDescriptor> {
        self.modules.insert(descriptor.tag, descriptor)
    }

    /// Look a module up by tag.
    pub fn get(&self, tag: &str) -> ArcResult<ModuleDescriptor> {
        self.modules
            .get(tag)
            .copied()
            .ok_or_else(|| ArcError::UnknownModule(tag.to_string()))
    }

    /// All modules, ordered by tag.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }
}
