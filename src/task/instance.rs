use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

use crate::core::{Arg, BoundArguments, Value};
use crate::encoding::Pipeline;
use crate::engine::Node;
use crate::error::{Error, StorageError};
use crate::hash::cache_key;
use crate::scope::ScopeStack;
use crate::storage::Storage;
use crate::task::TaskDescriptor;
use crate::task::memo::{Memoized, Slot};

/// One bound call of a [`TaskDescriptor`].
///
/// The bound arguments are frozen; the cache key and the graph node are
/// derived on first use and kept for the lifetime of the instance.
#[derive(Clone)]
pub struct TaskInstance(Arc<Instance>);

struct Instance {
    descriptor: TaskDescriptor,
    arguments: BoundArguments,
    save: bool,
    encoder: Arc<Pipeline>,
    key: OnceLock<String>,
    node: OnceLock<Node>,
}

impl TaskInstance {
    pub(crate) fn new(descriptor: TaskDescriptor, arguments: BoundArguments) -> Self {
        let save = descriptor.save();
        let encoder = descriptor.encoder_arc().clone();

        Self(Arc::new(Instance {
            descriptor,
            arguments,
            save,
            encoder,
            key: OnceLock::new(),
            node: OnceLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        self.0.descriptor.name()
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.0.descriptor
    }

    /// Frozen arguments, in declaration order.
    pub fn arguments(&self) -> &BoundArguments {
        &self.0.arguments
    }

    /// Whether the result is written to the active storage.
    pub fn save(&self) -> bool {
        self.0.save
    }

    pub fn encoder(&self) -> &Pipeline {
        &self.0.encoder
    }

    /// Storage key of this call: `<name>/<digest>[.<suffix>]`.
    pub fn key(&self) -> &str {
        self.0.key.get_or_init(|| {
            let digest = self.0.descriptor.hasher().hash(&self.0.arguments);
            cache_key(self.name(), &digest, self.0.encoder.suffix())
        })
    }

    /// Same call with the `save` flag overridden.
    pub fn with_save(&self, save: bool) -> TaskInstance {
        let key = self.0.key.clone();

        Self(Arc::new(Instance {
            descriptor: self.0.descriptor.clone(),
            arguments: self.0.arguments.clone(),
            save,
            encoder: self.0.encoder.clone(),
            key,
            node: OnceLock::new(),
        }))
    }

    /// Same call, stored through another pipeline. The key suffix follows
    /// the new pipeline.
    pub fn with_encoder(&self, encoder: Pipeline) -> TaskInstance {
        Self(Arc::new(Instance {
            descriptor: self.0.descriptor.clone(),
            arguments: self.0.arguments.clone(),
            save: self.0.save,
            encoder: Arc::new(encoder),
            key: OnceLock::new(),
            node: OnceLock::new(),
        }))
    }

    /// Graph node loading or computing this call.
    ///
    /// Node arguments become inputs of the returned node; the engine hands
    /// their values back when the node runs.
    pub fn node(&self) -> Node {
        self.0
            .node
            .get_or_init(|| {
                let mut inputs = Vec::new();
                let mut slots = Vec::with_capacity(self.0.arguments.len());

                for (name, arg) in self.0.arguments.iter() {
                    let slot = match arg {
                        Arg::Value(value) => Slot::Value(value.clone()),
                        Arg::Node(node) => {
                            inputs.push(node.clone());
                            Slot::Input(inputs.len() - 1)
                        }
                    };
                    slots.push((name.to_string(), slot));
                }

                let operation = Memoized {
                    task: self.name().to_string(),
                    slots,
                    run: self.0.descriptor.run_fn().clone(),
                    save: self.0.save,
                    encoder: self.0.encoder.clone(),
                };

                Node::new(self.key(), inputs, Arc::new(operation))
            })
            .clone()
    }

    /// Loads the result from the active storage, or computes it.
    pub fn compute(&self, stack: &ScopeStack) -> Result<Value, Error> {
        self.node().compute(stack)
    }

    /// Whether `storage` already holds a result for this call.
    pub fn is_stored_in(&self, storage: &dyn Storage) -> Result<bool, StorageError> {
        storage.contains(self.key())
    }
}

impl Debug for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInstance")
            .field("key", &self.key())
            .field("arguments", &self.0.arguments)
            .field("save", &self.0.save)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::args;
    use crate::core::Arguments;
    use crate::hash::{SEPARATOR, Tokenize, exclude};
    use crate::storage::MemoryStorage;

    fn identity(args: &Arguments) -> anyhow::Result<Value> {
        Ok(args.require("x")?.clone())
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::builder()
            .name("identity")
            .param("x")
            .param_default("verbose", false)
            .save(true)
            .run(["x"], identity)
            .unwrap()
    }

    #[test]
    fn test_key_format() {
        let instance = task().call(args! { "x" => 1 }).unwrap();
        let (name, digest) = instance.key().split_once(SEPARATOR).unwrap();

        assert_eq!(name, "identity");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_is_stable_across_instances() {
        let a = task().call(args! { "x" => "hello" }).unwrap();
        let b = task().call(args! { "x" => "hello" }).unwrap();
        let c = task().call(args! { "x" => "world" }).unwrap();

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_custom_hasher() {
        let quiet = TaskDescriptor::builder()
            .name("identity")
            .param("x")
            .param_default("verbose", false)
            .hasher(exclude(["verbose"], Tokenize))
            .run(["x"], identity)
            .unwrap();

        let a = quiet.call(args! { "x" => 1 }).unwrap();
        let b = quiet.call(args! { "x" => 1, "verbose" => true }).unwrap();
        assert_eq!(a.key(), b.key());

        let c = task().call(args! { "x" => 1 }).unwrap();
        let d = task().call(args! { "x" => 1, "verbose" => true }).unwrap();
        assert_ne!(c.key(), d.key());
    }

    #[test]
    fn test_with_save_keeps_key() {
        let instance = task().call(args! { "x" => 1 }).unwrap();
        let quiet = instance.with_save(false);

        assert!(instance.save());
        assert!(!quiet.save());
        assert_eq!(instance.key(), quiet.key());
    }

    #[test]
    fn test_node_key_is_cache_key() {
        let instance = task().call(args! { "x" => 1 }).unwrap();
        assert_eq!(instance.node().key(), instance.key());
    }

    #[test]
    fn test_node_arguments_become_inputs() {
        let upstream = task().call(args! { "x" => 7 }).unwrap();
        let downstream = task().call(args! { "x" => &upstream }).unwrap();

        let node = downstream.node();
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.inputs()[0].key(), upstream.key());

        let value = downstream.compute(&ScopeStack::new()).unwrap();
        assert_eq!(value, Value::from(7));
    }

    #[test]
    fn test_is_stored_in() {
        let storage = Arc::new(MemoryStorage::new());
        let instance = task().call(args! { "x" => 1 }).unwrap();
        assert!(!instance.is_stored_in(&*storage).unwrap());

        let mut stack = ScopeStack::new();
        let guard = stack.enter(storage.clone(), Default::default());
        instance.compute(&guard).unwrap();

        assert!(instance.is_stored_in(&*storage).unwrap());
    }
}
