use std::collections::HashMap;
use std::sync::Arc;

use canopy_types::Value;

use crate::error::{BehaviorError, BehaviorResult};
use crate::indexer::KeypathIndexer;
use crate::resolver::{LastWriterResolver, Resolver};
use crate::validator::{PermissionsValidator, Validator};
use crate::Indexer;

type ResolverCtor = Box<dyn Fn(&Value) -> BehaviorResult<Arc<dyn Resolver>> + Send + Sync>;
type ValidatorCtor = Box<dyn Fn(&Value) -> BehaviorResult<Arc<dyn Validator>> + Send + Sync>;
type IndexerCtor = Box<dyn Fn(&Value) -> BehaviorResult<Arc<dyn Indexer>> + Send + Sync>;

/// Plugin constructors keyed by the `Content-Type` discriminator of a
/// config subtree.
///
/// The behavior-tree reconciler reads a `Merge-Type` / `Validator` /
/// `Indexes/<name>` config out of document state and asks the registry for
/// the matching plugin instance.
pub struct PluginRegistry {
    resolvers: HashMap<String, ResolverCtor>,
    validators: HashMap<String, ValidatorCtor>,
    indexers: HashMap<String, IndexerCtor>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
            validators: HashMap::new(),
            indexers: HashMap::new(),
        }
    }

    /// A registry with the built-in plugins:
    /// `resolver/lastwriter`, `validator/permissions`, `indexer/keypath`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_resolver("resolver/lastwriter", |_config| {
            Ok(Arc::new(LastWriterResolver) as Arc<dyn Resolver>)
        });
        registry.register_validator("validator/permissions", |config| {
            Ok(Arc::new(PermissionsValidator::from_config(config)?) as Arc<dyn Validator>)
        });
        registry.register_indexer("indexer/keypath", |config| {
            Ok(Arc::new(KeypathIndexer::from_config(config)?) as Arc<dyn Indexer>)
        });
        registry
    }

    pub fn register_resolver(
        &mut self,
        content_type: &str,
        ctor: impl Fn(&Value) -> BehaviorResult<Arc<dyn Resolver>> + Send + Sync + 'static,
    ) {
        self.resolvers.insert(content_type.to_string(), Box::new(ctor));
    }

    pub fn register_validator(
        &mut self,
        content_type: &str,
        ctor: impl Fn(&Value) -> BehaviorResult<Arc<dyn Validator>> + Send + Sync + 'static,
    ) {
        self.validators.insert(content_type.to_string(), Box::new(ctor));
    }

    pub fn register_indexer(
        &mut self,
        content_type: &str,
        ctor: impl Fn(&Value) -> BehaviorResult<Arc<dyn Indexer>> + Send + Sync + 'static,
    ) {
        self.indexers.insert(content_type.to_string(), Box::new(ctor));
    }

    pub fn make_resolver(&self, config: &Value) -> BehaviorResult<Arc<dyn Resolver>> {
        let content_type = config_content_type(config)?;
        let ctor = self
            .resolvers
            .get(content_type)
            .ok_or_else(|| BehaviorError::UnknownPluginType(content_type.to_string()))?;
        ctor(config)
    }

    pub fn make_validator(&self, config: &Value) -> BehaviorResult<Arc<dyn Validator>> {
        let content_type = config_content_type(config)?;
        let ctor = self
            .validators
            .get(content_type)
            .ok_or_else(|| BehaviorError::UnknownPluginType(content_type.to_string()))?;
        ctor(config)
    }

    pub fn make_indexer(&self, config: &Value) -> BehaviorResult<Arc<dyn Indexer>> {
        let content_type = config_content_type(config)?;
        let ctor = self
            .indexers
            .get(content_type)
            .ok_or_else(|| BehaviorError::UnknownPluginType(content_type.to_string()))?;
        ctor(config)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn config_content_type(config: &Value) -> BehaviorResult<&str> {
    config
        .get("Content-Type")
        .and_then(Value::as_str)
        .ok_or_else(|| BehaviorError::BadConfig("plugin config missing 'Content-Type'".into()))
}
