//! Source registry: named resolver functions over an opaque render context.
//!
//! A registry is immutable once built. Loop bodies see their item and index
//! through an overlay [`Frame`] that checks its own bindings first and falls
//! through to the parent, so sibling and nested loops never share bindings.

use promptloom_core::SourceResult;
use promptloom_core::value::walk_path;
use promptloom_template::{SourceRef, ValueLookup};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Resolver signature: `(args, context) -> value`.
pub type Resolver<C> = Arc<dyn Fn(&Value, &C) -> SourceResult<Option<Value>> + Send + Sync>;

/// Anything that can resolve source references against a context.
pub trait Sources<C> {
    /// Resolve a reference, applying its path to the resolved value.
    /// Unknown sources resolve to `None`.
    fn resolve(&self, reference: &SourceRef, ctx: &C) -> SourceResult<Option<Value>>;

    /// Names this scope can resolve, sorted.
    fn list(&self) -> Vec<String>;
}

pub struct SourceRegistry<C> {
    resolvers: BTreeMap<String, Resolver<C>>,
}

impl<C> Default for SourceRegistry<C> {
    fn default() -> Self {
        Self {
            resolvers: BTreeMap::new(),
        }
    }
}

impl<C> Clone for SourceRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            resolvers: self.resolvers.clone(),
        }
    }
}

impl<C> std::fmt::Debug for SourceRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C> SourceRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a resolver.
    pub fn with<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: Fn(&Value, &C) -> SourceResult<Option<Value>> + Send + Sync + 'static,
    {
        self.resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl SourceRegistry<Value> {
    /// One source per top-level key of a JSON object context.
    pub fn from_context_keys(ctx: &Value) -> Self {
        let mut registry = Self::new();
        if let Value::Object(map) = ctx {
            for key in map.keys() {
                let name = key.clone();
                registry = registry.with(key.clone(), move |_, ctx: &Value| Ok(ctx.get(&name).cloned()));
            }
        }
        registry
    }
}

impl<C> Sources<C> for SourceRegistry<C> {
    fn resolve(&self, reference: &SourceRef, ctx: &C) -> SourceResult<Option<Value>> {
        let Some(resolver) = self.resolvers.get(&reference.source) else {
            return Ok(None);
        };
        let value = resolver(&reference.args, ctx)?;
        Ok(value.and_then(|v| walk_path(&v, &reference.path).cloned()))
    }

    fn list(&self) -> Vec<String> {
        self.resolvers.keys().cloned().collect()
    }
}

/// An overlay scope: bindings first, then the parent.
pub struct Frame<'a, C> {
    bindings: BTreeMap<String, Value>,
    parent: &'a dyn Sources<C>,
}

impl<'a, C> Frame<'a, C> {
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }
}

/// Wrap `parent` with an overlay of `bindings`. The parent is not modified.
pub fn with_additional_frame<'a, C>(
    parent: &'a dyn Sources<C>,
    bindings: BTreeMap<String, Value>,
) -> Frame<'a, C> {
    Frame { bindings, parent }
}

impl<C> Sources<C> for Frame<'_, C> {
    fn resolve(&self, reference: &SourceRef, ctx: &C) -> SourceResult<Option<Value>> {
        match self.bindings.get(&reference.source) {
            Some(bound) => Ok(walk_path(bound, &reference.path).cloned()),
            None => self.parent.resolve(reference, ctx),
        }
    }

    fn list(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.parent.list().into_iter().collect();
        names.extend(self.bindings.keys().cloned());
        names.into_iter().collect()
    }
}

/// Adapts a scope and its context to the template crate's [`ValueLookup`].
pub struct ScopeLookup<'a, C> {
    sources: &'a dyn Sources<C>,
    ctx: &'a C,
}

impl<'a, C> ScopeLookup<'a, C> {
    pub fn new(sources: &'a dyn Sources<C>, ctx: &'a C) -> Self {
        Self { sources, ctx }
    }
}

impl<C> ValueLookup for ScopeLookup<'_, C> {
    fn lookup(&self, reference: &SourceRef) -> SourceResult<Option<Value>> {
        self.sources.resolve(reference, self.ctx)
    }
}
