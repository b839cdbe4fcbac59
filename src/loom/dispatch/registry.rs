use std::{
    any::Any,
    sync::{LazyLock, RwLock},
};

use rustc_hash::FxHashMap as HashMap;

use super::{DispatchEntry, DispatchError, DispatchFn, DispatchKey, NativeDispatchKey};
use crate::loom::num::{HasTypeInfo, TypeInfo};

static GLOBAL_REGISTRY: LazyLock<DispatchRegistry> = LazyLock::new(DispatchRegistry::new);

/// Maps an operation name and a [`DispatchKey`] to a kernel.
///
/// Registration and lookup are serialized by a reader-writer lock, so the registry may be used
/// from any thread. Entries live until they are unregistered, the registry is cleared or the
/// registry is dropped; the process-wide one lives until exit.
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    entries: RwLock<HashMap<String, HashMap<DispatchKey, DispatchEntry>>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    #[inline]
    pub fn global() -> &'static Self {
        &GLOBAL_REGISTRY
    }

    /// Inserts an entry. An existing entry under the same name and key is replaced.
    pub fn add_dispatch_entry(&self, name: &str, key: DispatchKey, entry: DispatchEntry) {
        let mut entries = self.entries.write().expect("failed to lock dispatch registry");
        let table = entries.entry(name.to_owned()).or_default();
        match table.insert(key, entry) {
            Some(_) => log::warn!("overwrite dispatch entry `{name}` with key {key}"),
            None => log::debug!("add dispatch entry `{name}` with key {key}"),
        }
    }

    /// Registers a kernel. An existing kernel under the same name and key is replaced.
    #[inline]
    pub fn register<F: DispatchFn>(&self, name: &str, key: DispatchKey, f: F) {
        self.add_dispatch_entry(name, key, DispatchEntry::new(f))
    }

    /// Removes an entry, returning it if it was present.
    pub fn unregister(&self, name: &str, key: DispatchKey) -> Option<DispatchEntry> {
        let mut entries = self.entries.write().expect("failed to lock dispatch registry");
        let table = entries.get_mut(name)?;
        let entry = table.remove(&key);
        if table.is_empty() {
            entries.remove(name);
        }
        if entry.is_some() {
            log::debug!("remove dispatch entry `{name}` with key {key}");
        }
        entry
    }

    pub fn has_dispatch_entry(&self, name: &str, key: DispatchKey) -> bool {
        let entries = self.entries.read().expect("failed to lock dispatch registry");
        entries
            .get(name)
            .is_some_and(|table| table.contains_key(&key))
    }

    pub fn get_dispatch_entry(
        &self,
        name: &str,
        key: DispatchKey,
    ) -> Result<DispatchEntry, DispatchError> {
        let entries = self.entries.read().expect("failed to lock dispatch registry");
        entries
            .get(name)
            .and_then(|table| table.get(&key))
            .cloned()
            .ok_or_else(|| DispatchError::NotFound {
                name: name.to_owned(),
                key,
            })
    }

    /// Looks up an entry and calls it. The registry is not locked while the kernel runs.
    pub fn call_dispatch_entry(
        &self,
        name: &str,
        key: DispatchKey,
        args: &[&dyn Any],
    ) -> Result<(), DispatchError> {
        self.get_dispatch_entry(name, key)?.call(args)
    }

    /// Dispatches on the fast path if all types are native, or through this registry otherwise.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(name = %name)))]
    pub fn do_dispatch<const N: usize>(
        &self,
        table: &[DispatchEntry],
        name: &str,
        on: &DispatchOn<N>,
        args: &[&dyn Any],
    ) -> Result<(), DispatchError> {
        match on.native_key() {
            Some(key) => {
                let entry = table.get(key.index()).ok_or(DispatchError::TableIndex {
                    key: key.index(),
                    len: table.len(),
                })?;
                entry.call(args)
            }
            None => self.call_dispatch_entry(name, on.key(), args),
        }
    }

    /// Number of registered entries over all names.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().expect("failed to lock dispatch registry");
        entries.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write().expect("failed to lock dispatch registry");
        entries.clear();
        log::debug!("clear dispatch registry");
    }
}

/// Registers a kernel in the process-wide registry.
#[inline]
pub fn register_dispatch_fn<F: DispatchFn>(name: &str, key: DispatchKey, f: F) {
    DispatchRegistry::global().register(name, key, f)
}

/// Removes a kernel from the process-wide registry. Removing a missing kernel does nothing.
#[inline]
pub fn unregister_dispatch_fn(name: &str, key: DispatchKey) {
    DispatchRegistry::global().unregister(name, key);
}

#[inline]
pub fn has_dispatch_entry(name: &str, key: DispatchKey) -> bool {
    DispatchRegistry::global().has_dispatch_entry(name, key)
}

#[inline]
pub fn get_dispatch_entry(name: &str, key: DispatchKey) -> Result<DispatchEntry, DispatchError> {
    DispatchRegistry::global().get_dispatch_entry(name, key)
}

#[inline]
pub fn call_dispatch_entry(
    name: &str,
    key: DispatchKey,
    args: &[&dyn Any],
) -> Result<(), DispatchError> {
    DispatchRegistry::global().call_dispatch_entry(name, key, args)
}

/// Dispatches through `table` or the process-wide registry.
#[inline]
pub fn do_dispatch<const N: usize>(
    table: &[DispatchEntry],
    name: &str,
    on: &DispatchOn<N>,
    args: &[&dyn Any],
) -> Result<(), DispatchError> {
    DispatchRegistry::global().do_dispatch(table, name, on, args)
}

/// The types a call dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOn<const N: usize> {
    types: [TypeInfo; N],
    all_native: bool,
}

impl<const N: usize> DispatchOn<N> {
    /// Fails if any of the types is not a compute type.
    pub fn new(types: [TypeInfo; N]) -> Result<Self, DispatchError> {
        if let Some(&info) = types.iter().find(|info| !info.is_compute()) {
            return Err(DispatchError::NonComputeType(info));
        }
        let all_native = types.iter().all(TypeInfo::is_native);
        Ok(Self { types, all_native })
    }

    /// Collects the types of some values.
    pub fn from_values(values: [&dyn HasTypeInfo; N]) -> Result<Self, DispatchError> {
        Self::new(values.map(|value| value.type_info()))
    }

    #[inline]
    pub fn types(&self) -> &[TypeInfo; N] {
        &self.types
    }

    #[inline]
    pub fn is_all_native(&self) -> bool {
        self.all_native
    }

    /// The dense key, if all types are native.
    pub fn native_key(&self) -> Option<NativeDispatchKey<N>> {
        self.all_native
            .then(|| NativeDispatchKey::from_tokens(self.types.map(|info| info.token())))
    }

    /// The general key.
    pub fn key(&self) -> DispatchKey {
        DispatchKey::new(self.types.map(|info| info.token()))
    }
}
