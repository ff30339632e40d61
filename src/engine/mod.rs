//! Minimal lazy graph engine.
//!
//! A [`Node`] is a deferred computation with an identity (its key), a list of
//! input nodes and an [`Operation`] producing its value from the values of
//! those inputs. Nothing runs until [`Node::compute`] is called; at that point
//! the reachable graph is assembled, nodes sharing a key are merged, and the
//! graph is executed on the rayon thread pool.
//!
//! The checkpoint layer only relies on this contract: it hands the engine an
//! [`Operation`] plus the nodes it depends on, and receives the concrete input
//! values back at execution time.

mod runner;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{Blake3Hasher, Hash32, Value};
use crate::error::Error;
use crate::hash::feed_value;
use crate::scope::{Scope, ScopeStack};

static IMPURE: AtomicU64 = AtomicU64::new(0);

/// Work performed by a node once all its inputs are available.
///
/// Runs on a rayon worker. Implementations must not call
/// [`Node::compute`] or [`compute_all`], see [`Node::compute`].
pub trait Operation: Send + Sync {
    /// Short human readable label, used in logs.
    fn name(&self) -> &str;

    /// Produces the node value. `inputs` are the values of the node inputs,
    /// in order, and `scope` is the storage scope captured when the
    /// computation was started.
    fn execute(&self, key: &str, inputs: &[Value], scope: &Scope) -> Result<Value, Error>;
}

/// Handle to a deferred computation.
///
/// Cloning is cheap; clones share identity.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    key: Arc<str>,
    inputs: Vec<Node>,
    operation: Arc<dyn Operation>,
}

impl Node {
    pub fn new(key: impl Into<Arc<str>>, inputs: Vec<Node>, operation: Arc<dyn Operation>) -> Self {
        Self(Arc::new(NodeInner {
            key: key.into(),
            inputs,
            operation,
        }))
    }

    /// A constant. The identity is derived from the value itself.
    pub fn value(value: impl Into<Value>) -> Self {
        let value = value.into();

        let mut hasher = Blake3Hasher::default();
        feed_value(&mut hasher, &value);
        let key = format!("value-{}", Hash32::from(hasher).to_hex());

        Self::new(key, Vec::new(), Arc::new(Constant(value)))
    }

    /// An impure computation: every call creates a fresh identity, even for
    /// identical inputs.
    pub fn delayed<F>(name: &str, inputs: Vec<Node>, f: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let id = IMPURE.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Blake3Hasher::default();
        hasher.update_framed(name.as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&id.to_le_bytes());
        let key = format!("{name}-{}", Hash32::from(hasher).to_hex());

        Self::new(key, inputs, Arc::new(Function::new(name, f)))
    }

    /// A pure computation: the identity is derived from the name and the
    /// identities of the inputs, so building the same call twice yields the
    /// same node.
    pub fn pure<F>(name: &str, inputs: Vec<Node>, f: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let mut hasher = Blake3Hasher::default();
        hasher.update_framed(name.as_bytes());
        for input in &inputs {
            hasher.update_framed(input.key().as_bytes());
        }
        let key = format!("{name}-{}", Hash32::from(hasher).to_hex());

        Self::new(key, inputs, Arc::new(Function::new(name, f)))
    }

    pub fn key(&self) -> &str {
        &self.0.key
    }

    pub fn inputs(&self) -> &[Node] {
        &self.0.inputs
    }

    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.0.operation
    }

    /// Computes the node inside the scopes currently active on `stack`.
    ///
    /// Blocks the calling thread until the graph finishes. Operations and
    /// task bodies run on the rayon pool and must not compute nodes
    /// themselves: the waiting worker can't pick up the nested graph, and on
    /// a single-thread pool it never completes.
    pub fn compute(&self, stack: &ScopeStack) -> Result<Value, Error> {
        self.compute_in(&stack.snapshot())
    }

    /// Computes the node with an already captured scope.
    pub fn compute_in(&self, scope: &Scope) -> Result<Value, Error> {
        let mut values = runner::run(std::slice::from_ref(self), scope)?;
        Ok(values.swap_remove(0))
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.key())
    }
}

/// Computes several nodes as one graph, sharing common sub-computations.
pub fn compute_all(nodes: &[Node], stack: &ScopeStack) -> Result<Vec<Value>, Error> {
    runner::run(nodes, &stack.snapshot())
}

struct Constant(Value);

impl Operation for Constant {
    fn name(&self) -> &str {
        "value"
    }

    fn execute(&self, _: &str, _: &[Value], _: &Scope) -> Result<Value, Error> {
        Ok(self.0.clone())
    }
}

type FunctionPtr = Box<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

struct Function {
    name: String,
    func: FunctionPtr,
}

impl Function {
    fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

impl Operation for Function {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, key: &str, inputs: &[Value], _: &Scope) -> Result<Value, Error> {
        (self.func)(inputs).map_err(|source| Error::Run {
            key: key.to_string(),
            source,
        })
    }
}
