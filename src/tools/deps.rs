use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ToolError;

type DynDependency = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum DependencyKey {
    Typed(TypeId),
    Named(String),
}

/// Values handed to tool handlers, looked up by type or by name.
#[derive(Clone, Default)]
pub struct DependencyMap {
    entries: Arc<RwLock<HashMap<DependencyKey, DynDependency>>>,
}

impl std::fmt::Debug for DependencyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyMap")
            .field("len", &self.len())
            .finish()
    }
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.write()
            .insert(DependencyKey::Typed(TypeId::of::<T>()), Arc::new(value));
    }

    pub fn insert_named<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.write()
            .insert(DependencyKey::Named(key.into()), Arc::new(value));
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lookup(&DependencyKey::Typed(TypeId::of::<T>()))
    }

    pub fn get_named<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lookup(&DependencyKey::Named(key.to_string()))
    }

    /// Like [`DependencyMap::get`], but reports the missing type as a tool error.
    pub fn require<T>(&self) -> Result<Arc<T>, ToolError>
    where
        T: Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(ToolError::MissingDependency(type_name::<T>()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns a new map holding `self` with every entry of `overrides` on top.
    pub fn merged_with(&self, overrides: &DependencyMap) -> DependencyMap {
        let mut entries = self.read().clone();
        entries.extend(
            overrides
                .read()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        DependencyMap {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    fn lookup<T>(&self, key: &DependencyKey) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.read().get(key)?.clone();
        Arc::downcast::<T>(value).ok()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DependencyKey, DynDependency>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DependencyKey, DynDependency>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
