//! Scoped activation of storages.
//!
//! A [`ScopeStack`] holds the storages active for one execution context.
//! Entering a scope pushes an entry and returns a [`ScopeGuard`]; dropping the
//! guard pops exactly that entry, on every exit path including `?` and
//! panics. Because the guard holds the stack mutably, nested scopes must be
//! entered through the guard and are released strictly in LIFO order.
//!
//! ```
//! use std::sync::Arc;
//! use kioku::{MemoryStorage, ScopeOptions, ScopeStack};
//!
//! let outer = Arc::new(MemoryStorage::new());
//! let inner = Arc::new(MemoryStorage::new());
//!
//! let mut stack = ScopeStack::new();
//! {
//!     let mut a = stack.enter(outer, ScopeOptions::default());
//!     let b = a.enter(inner, ScopeOptions::default());
//!     assert_eq!(b.depth(), 2);
//! }
//! assert_eq!(stack.depth(), 0);
//! ```
//!
//! Nodes never look at the stack while they run. Computing a node takes a
//! [`Scope`] snapshot first and that snapshot travels with every node to
//! whichever thread executes it.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::storage::{Chain, Storage};

/// Options for entering a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Whether results computed inside the scope are written to its storage.
    pub save: bool,
    /// Whether reads fall back to the storages of enclosing scopes.
    pub nested: bool,
}

impl ScopeOptions {
    /// Reads and writes, falling back to enclosing scopes for reads.
    pub fn new() -> Self {
        Self {
            save: true,
            nested: true,
        }
    }

    /// Only reads from the storage, never writes.
    pub fn load_only() -> Self {
        Self {
            save: false,
            ..Self::new()
        }
    }

    pub fn save(mut self, save: bool) -> Self {
        self.save = save;
        self
    }

    pub fn nested(mut self, nested: bool) -> Self {
        self.nested = nested;
        self
    }
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    storage: Arc<dyn Storage>,
    save: bool,
    include_parent: bool,
}

/// LIFO stack of active storages for one execution context.
#[derive(Debug, Default)]
pub struct ScopeStack {
    entries: Vec<Entry>,
}

impl ScopeStack {
    /// An empty stack: nothing is loaded and nothing is saved.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Activates `storage` until the returned guard is dropped.
    pub fn enter(&mut self, storage: Arc<dyn Storage>, options: ScopeOptions) -> ScopeGuard<'_> {
        tracing::debug!(
            depth = self.entries.len() + 1,
            save = options.save,
            nested = options.nested,
            "entering storage scope"
        );

        self.entries.push(Entry {
            storage,
            save: options.save,
            include_parent: options.nested,
        });

        let depth = self.entries.len();
        ScopeGuard { stack: self, depth }
    }

    /// Runs `f` with `storage` active, releasing it afterwards.
    pub fn scoped<R>(
        &mut self,
        storage: Arc<dyn Storage>,
        options: ScopeOptions,
        f: impl FnOnce(&mut ScopeStack) -> R,
    ) -> R {
        let mut guard = self.enter(storage, options);
        f(&mut guard)
    }

    /// Captures the effective read and write storages at this point.
    pub fn snapshot(&self) -> Scope {
        let mut readers = Vec::new();

        for entry in self.entries.iter().rev() {
            readers.push(entry.storage.clone());
            if !entry.include_parent {
                break;
            }
        }

        let reader = match readers.len() {
            0 => None,
            1 => readers.pop(),
            _ => Some(Arc::new(Chain::new(readers)) as Arc<dyn Storage>),
        };

        let writer = self
            .entries
            .last()
            .filter(|entry| entry.save)
            .map(|entry| entry.storage.clone());

        Scope { reader, writer }
    }
}

/// Keeps a scope entry pushed; pops it on drop.
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    stack: &'a mut ScopeStack,
    depth: usize,
}

impl Deref for ScopeGuard<'_> {
    type Target = ScopeStack;

    fn deref(&self) -> &Self::Target {
        self.stack
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stack
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // A leaked inner guard can leave extra entries above ours.
        self.stack.entries.truncate(self.depth - 1);
        tracing::debug!(depth = self.depth, "leaving storage scope");
    }
}

/// Frozen view of a [`ScopeStack`], handed to every node of a computation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    reader: Option<Arc<dyn Storage>>,
    writer: Option<Arc<dyn Storage>>,
}

impl Scope {
    /// Scope with no active storage.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Effective read storage: the active entries from the top of the stack
    /// down to the first one that doesn't include its parent.
    pub fn reader(&self) -> Option<&Arc<dyn Storage>> {
        self.reader.as_ref()
    }

    /// Effective write storage: the top entry, if it saves.
    pub fn writer(&self) -> Option<&Arc<dyn Storage>> {
        self.writer.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.reader.is_some()
    }
}
