//! Factories for `Custom` pipeline operators.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use arrow_schema::SchemaRef;
use quiver_common::{CodegenOptions, Result};

use crate::translator::Translator;

/// Builds the translator for one `Custom` operator name.
pub trait TranslatorFactory: Send + Sync {
    /// Name matched against `CustomOp::op_name`.
    fn name(&self) -> &str;

    /// Instantiate a translator reading batches shaped like `input_schema`.
    fn create(
        &self,
        input_schema: SchemaRef,
        config: &HashMap<String, String>,
        codegen: &CodegenOptions,
    ) -> Result<Box<dyn Translator>>;
}

/// Name-keyed set of translator factories.
#[derive(Default)]
pub struct TranslatorRegistry {
    inner: RwLock<HashMap<String, Arc<dyn TranslatorFactory>>>,
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

impl TranslatorRegistry {
    /// Register or replace a factory.
    ///
    /// Returns `true` when a factory with the same name was replaced.
    pub fn register(&self, factory: Arc<dyn TranslatorFactory>) -> bool {
        self.inner
            .write()
            .expect("translator registry lock poisoned")
            .insert(factory.name().to_string(), factory)
            .is_some()
    }

    /// Remove a factory; returns `true` when one was registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.inner
            .write()
            .expect("translator registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TranslatorFactory>> {
        self.inner
            .read()
            .expect("translator registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .inner
            .read()
            .map(|m| m.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn global_registry() -> &'static Arc<TranslatorRegistry> {
    static REGISTRY: OnceLock<Arc<TranslatorRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(TranslatorRegistry::default()))
}

/// Process-wide registry used by `Transformer::to_translator`.
pub fn global_translator_registry() -> Arc<TranslatorRegistry> {
    Arc::clone(global_registry())
}

/// Register `factory` in the process-wide registry.
pub fn register_global_translator_factory(factory: Arc<dyn TranslatorFactory>) -> bool {
    global_registry().register(factory)
}

/// Remove `name` from the process-wide registry.
pub fn deregister_global_translator_factory(name: &str) -> bool {
    global_registry().deregister(name)
}
