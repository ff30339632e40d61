//! Checkpointed tasks.
//!
//! A [`TaskDescriptor`] is the reusable definition of a computation: its name,
//! declared parameters and dependencies, the `run` function, the encoding
//! pipeline and the argument hasher. Calling it with explicit arguments binds
//! a [`TaskInstance`], which carries the cache key and the graph node that
//! loads or computes the result.
//!
//! ```
//! use std::sync::Arc;
//! use kioku::{MemoryStorage, ScopeOptions, ScopeStack, TaskDescriptor, Value, args};
//!
//! let double = TaskDescriptor::builder()
//!     .name("double")
//!     .param("x")
//!     .save(true)
//!     .run(["x"], |args| {
//!         let x: i64 = args.get_as("x")?;
//!         Ok(Value::from(2 * x))
//!     })
//!     .unwrap();
//!
//! let mut stack = ScopeStack::new();
//! let scope = stack.enter(Arc::new(MemoryStorage::new()), ScopeOptions::default());
//!
//! let value = double.call(args! { "x" => 21 }).unwrap().compute(&scope).unwrap();
//! assert_eq!(value, Value::from(42));
//! ```

mod instance;
mod memo;
mod resolver;

use std::any::type_name;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{Arguments, BoundArguments, Value};
use crate::encoding::Pipeline;
use crate::error::{ConfigurationError, DependencyResolutionError};
use crate::hash::{ArgumentHasher, Tokenize, function_name};

pub use crate::task::instance::TaskInstance;
pub use crate::task::resolver::{Constant, Forward, Resolver, constant};

pub(crate) type RunFn = Arc<dyn Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync>;

/// Immutable definition of a checkpointed computation.
///
/// Cloning is cheap, clones share the same definition.
#[derive(Clone)]
pub struct TaskDescriptor(Arc<Descriptor>);

struct Descriptor {
    name: String,
    declarations: Vec<Declaration>,
    expects: Vec<String>,
    run: RunFn,
    save: bool,
    encoder: Arc<Pipeline>,
    hasher: Arc<dyn ArgumentHasher>,
}

struct Declaration {
    name: String,
    default: Option<Value>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl TaskDescriptor {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Declared parameter names, in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.0.declarations.iter().map(|d| d.name.as_str())
    }

    /// Names the `run` function expects to receive.
    pub fn expects(&self) -> &[String] {
        &self.0.expects
    }

    /// Default `save` flag of instances created from this task.
    pub fn save(&self) -> bool {
        self.0.save
    }

    pub fn encoder(&self) -> &Pipeline {
        &self.0.encoder
    }

    /// Same task, storing its results through another pipeline.
    pub fn with_encoder(&self, encoder: Pipeline) -> TaskDescriptor {
        self.rebuild(|d| d.encoder = Arc::new(encoder))
    }

    /// Same task, with another `save` default.
    pub fn with_save(&self, save: bool) -> TaskDescriptor {
        self.rebuild(|d| d.save = save)
    }

    fn rebuild(&self, f: impl FnOnce(&mut Descriptor)) -> TaskDescriptor {
        let mut descriptor = Descriptor {
            name: self.0.name.clone(),
            declarations: self
                .0
                .declarations
                .iter()
                .map(|d| Declaration {
                    name: d.name.clone(),
                    default: d.default.clone(),
                    resolver: d.resolver.clone(),
                })
                .collect(),
            expects: self.0.expects.clone(),
            run: self.0.run.clone(),
            save: self.0.save,
            encoder: self.0.encoder.clone(),
            hasher: self.0.hasher.clone(),
        };
        f(&mut descriptor);
        TaskDescriptor(Arc::new(descriptor))
    }

    /// Binds a call.
    ///
    /// Each declared parameter takes its explicit argument if one was passed,
    /// otherwise its default, otherwise the value of its dependency resolver.
    /// Resolvers run in declaration order and only for parameters still
    /// unbound, each at most once per call.
    pub fn call(&self, explicit: BoundArguments) -> Result<TaskInstance, DependencyResolutionError> {
        let task = &self.0;

        for name in explicit.names() {
            if !task.declarations.iter().any(|d| d.name == name) {
                return Err(DependencyResolutionError::UnknownArgument {
                    task: task.name.clone(),
                    name: name.to_string(),
                });
            }
        }

        let mut bound = BoundArguments::new();
        let mut explicit = explicit;

        for declaration in &task.declarations {
            if let Some(arg) = explicit.remove(&declaration.name) {
                bound.insert(declaration.name.clone(), arg);
            } else if let Some(default) = &declaration.default {
                bound.insert(declaration.name.clone(), default.clone().into());
            }
        }

        for declaration in &task.declarations {
            let Some(resolver) = &declaration.resolver else {
                continue;
            };

            if bound.contains(&declaration.name) {
                continue;
            }

            tracing::debug!(task = %task.name, dependency = %declaration.name, "resolving dependency");

            let arg = resolver.resolve(&bound).map_err(|source| {
                DependencyResolutionError::Resolver {
                    task: task.name.clone(),
                    name: declaration.name.clone(),
                    source,
                }
            })?;

            bound.insert(declaration.name.clone(), arg);
        }

        for name in &task.expects {
            if !bound.contains(name) {
                return Err(DependencyResolutionError::Missing {
                    task: task.name.clone(),
                    name: name.clone(),
                });
            }
        }

        // Resolved dependencies were appended last, restore declaration order.
        let arguments = task
            .declarations
            .iter()
            .filter_map(|d| bound.remove(&d.name).map(|arg| (d.name.clone(), arg)))
            .collect();

        Ok(TaskInstance::new(self.clone(), arguments))
    }

    /// Resolver calling this task with the named arguments of the dependent
    /// call, for use with [`TaskBuilder::dependency`].
    pub fn forward<I, S>(&self, names: I) -> Forward
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Forward::new(self.clone(), names.into_iter().map(Into::into).collect())
    }

    pub(crate) fn run_fn(&self) -> &RunFn {
        &self.0.run
    }

    pub(crate) fn hasher(&self) -> &dyn ArgumentHasher {
        &*self.0.hasher
    }

    pub(crate) fn encoder_arc(&self) -> &Arc<Pipeline> {
        &self.0.encoder
    }
}

impl Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.0.name)
            .field("parameters", &self.parameters().collect::<Vec<_>>())
            .field("expects", &self.0.expects)
            .field("save", &self.0.save)
            .field("encoder", &self.0.encoder)
            .finish_non_exhaustive()
    }
}

enum Naming {
    Fixed(Cow<'static, str>),
    Derived(fn(&str) -> String),
}

/// Step by step declaration of a [`TaskDescriptor`].
///
/// Nothing is validated until [`TaskBuilder::run`] is called.
pub struct TaskBuilder {
    name: Option<Naming>,
    parameters: Vec<(String, Option<Value>)>,
    dependencies: Vec<(String, Arc<dyn Resolver>)>,
    save: bool,
    encoder: Option<Pipeline>,
    hasher: Option<Arc<dyn ArgumentHasher>>,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            name: None,
            parameters: Vec::new(),
            dependencies: Vec::new(),
            save: false,
            encoder: None,
            hasher: None,
        }
    }
}

impl TaskBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(Naming::Fixed(name.into()));
        self
    }

    /// Derives the name from the type name of the `run` callable.
    pub fn name_with(mut self, naming: fn(&str) -> String) -> Self {
        self.name = Some(Naming::Derived(naming));
        self
    }

    /// Declares a parameter without a default.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.parameters.push((name.into(), None));
        self
    }

    pub fn param_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.parameters.push((name.into(), Some(default.into())));
        self
    }

    /// Declares a parameter whose value, when neither passed nor defaulted,
    /// comes from `resolver`.
    pub fn dependency(mut self, name: impl Into<String>, resolver: impl Resolver + 'static) -> Self {
        self.dependencies.push((name.into(), Arc::new(resolver)));
        self
    }

    /// Whether results are written to the active storage. Defaults to `false`.
    pub fn save(mut self, save: bool) -> Self {
        self.save = save;
        self
    }

    pub fn encoder(mut self, encoder: Pipeline) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn hasher(mut self, hasher: impl ArgumentHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Finishes the declaration. `expects` lists the names `run` reads from
    /// its arguments; each must be declared as a parameter or a dependency.
    ///
    /// Without [`name`](Self::name) the task is named after the `run`
    /// function. Closures have no name of their own, every closure in a
    /// function would share it and with it their cache keys, so a closure
    /// must be named explicitly.
    pub fn run<F, I, S>(self, expects: I, run: F) -> Result<TaskDescriptor, ConfigurationError>
    where
        F: Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = match self.name {
            Some(Naming::Fixed(name)) => name.into_owned(),
            Some(Naming::Derived(naming)) => naming(type_name::<F>()),
            None if type_name::<F>().ends_with("{{closure}}") => {
                return Err(ConfigurationError::UnnamedClosure);
            }
            None => function_name(type_name::<F>()),
        };

        if name.is_empty() {
            return Err(ConfigurationError::EmptyName);
        }

        let expects: Vec<String> = expects.into_iter().map(Into::into).collect();

        let mut declarations: Vec<Declaration> = Vec::new();
        let mut positions = HashMap::new();

        for (param, default) in self.parameters {
            if positions.contains_key(&param) {
                return Err(ConfigurationError::DuplicateParameter { task: name, name: param });
            }

            positions.insert(param.clone(), declarations.len());
            declarations.push(Declaration {
                name: param,
                default,
                resolver: None,
            });
        }

        let mut seen = Vec::new();
        for (dependency, resolver) in self.dependencies {
            if seen.contains(&dependency) {
                return Err(ConfigurationError::DuplicateDependency {
                    task: name,
                    name: dependency,
                });
            }
            seen.push(dependency.clone());

            if !expects.contains(&dependency) {
                tracing::warn!(task = %name, dependency = %dependency, "dependency is not expected by run, ignoring it");
                continue;
            }

            match positions.get(&dependency) {
                Some(&index) => declarations[index].resolver = Some(resolver),
                None => {
                    positions.insert(dependency.clone(), declarations.len());
                    declarations.push(Declaration {
                        name: dependency,
                        default: None,
                        resolver: Some(resolver),
                    });
                }
            }
        }

        for expected in &expects {
            if !positions.contains_key(expected) {
                return Err(ConfigurationError::UndeclaredParameter {
                    task: name,
                    name: expected.clone(),
                });
            }
        }

        Ok(TaskDescriptor(Arc::new(Descriptor {
            name,
            declarations,
            expects,
            run: Arc::new(run),
            save: self.save,
            encoder: Arc::new(self.encoder.unwrap_or_default()),
            hasher: self.hasher.unwrap_or_else(|| Arc::new(Tokenize)),
        })))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::args;
    use crate::core::Arg;
    use crate::error::Error;
    use crate::scope::{ScopeOptions, ScopeStack};
    use crate::storage::MemoryStorage;

    fn sum(args: &Arguments) -> anyhow::Result<Value> {
        let a: i64 = args.get_as("a")?;
        let b: i64 = args.get_as("b")?;
        Ok(Value::from(a + b))
    }

    fn adder() -> TaskDescriptor {
        TaskDescriptor::builder()
            .param("a")
            .param_default("b", 10)
            .run(["a", "b"], sum)
            .unwrap()
    }

    #[test]
    fn test_default_name_from_function() {
        assert_eq!(adder().name(), "sum");
    }

    #[test]
    fn test_unnamed_closure_is_rejected() {
        let err = TaskDescriptor::builder()
            .param("a")
            .run(["a"], |args| Ok(args.require("a")?.clone()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnnamedClosure));

        let named = TaskDescriptor::builder()
            .name("first")
            .param("a")
            .run(["a"], |args| Ok(args.require("a")?.clone()))
            .unwrap();
        assert_eq!(named.name(), "first");
    }

    #[test]
    fn test_name_with() {
        let task = TaskDescriptor::builder()
            .name_with(|name| format!("custom-{}", function_name(name)))
            .param("a")
            .param("b")
            .run(["a", "b"], sum)
            .unwrap();

        assert_eq!(task.name(), "custom-sum");
    }

    #[test]
    fn test_default_fills_missing() {
        let instance = adder().call(args! { "a" => 1 }).unwrap();
        let b = instance.arguments().get("b").unwrap();
        assert_eq!(b.as_value(), Some(&Value::from(10)));
    }

    #[test]
    fn test_explicit_beats_default() {
        let instance = adder().call(args! { "a" => 1, "b" => 2 }).unwrap();
        let value = instance.compute(&ScopeStack::new()).unwrap();
        assert_eq!(value, Value::from(3));
    }

    #[test]
    fn test_bound_order_is_declaration_order() {
        let a = adder().call(args! { "b" => 2, "a" => 1 }).unwrap();
        let b = adder().call(args! { "a" => 1, "b" => 2 }).unwrap();

        assert_eq!(a.arguments().names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_missing_parameter() {
        let err = adder().call(args! { "b" => 2 }).unwrap_err();
        assert!(matches!(err, DependencyResolutionError::Missing { ref name, .. } if name == "a"));
    }

    #[test]
    fn test_unknown_argument() {
        let err = adder().call(args! { "a" => 1, "c" => 2 }).unwrap_err();
        assert!(matches!(err, DependencyResolutionError::UnknownArgument { ref name, .. } if name == "c"));
    }

    #[test]
    fn test_undeclared_parameter() {
        let err = TaskDescriptor::builder().param("a").run(["a", "b"], sum).unwrap_err();
        assert!(matches!(err, ConfigurationError::UndeclaredParameter { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_duplicate_parameter() {
        let err = TaskDescriptor::builder()
            .param("a")
            .param("a")
            .param("b")
            .run(["a", "b"], sum)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateParameter { .. }));
    }

    #[test]
    fn test_duplicate_dependency() {
        let err = TaskDescriptor::builder()
            .param("a")
            .dependency("b", constant(1))
            .dependency("b", constant(2))
            .run(["a", "b"], sum)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateDependency { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_empty_name() {
        let err = TaskDescriptor::builder()
            .name("")
            .param("a")
            .param("b")
            .run(["a", "b"], sum)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyName));
    }

    #[test]
    fn test_unexpected_dependency_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let task = TaskDescriptor::builder()
            .param("a")
            .param("b")
            .dependency("unused", move |_: &BoundArguments| -> anyhow::Result<Arg> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arg::Value(Value::Null))
            })
            .run(["a", "b"], sum)
            .unwrap();

        let instance = task.call(args! { "a" => 1, "b" => 2 }).unwrap();
        assert!(!instance.arguments().contains("unused"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(task.call(args! { "a" => 1, "b" => 2, "unused" => 3 }).is_err());
    }

    #[test]
    fn test_dependency_sees_bound_arguments() {
        let task = TaskDescriptor::builder()
            .param("a")
            .dependency("b", |args: &BoundArguments| -> anyhow::Result<Arg> {
                let a = args.get("a").and_then(Arg::as_value).cloned();
                Ok(Arg::Value(a.unwrap_or(Value::Null)))
            })
            .run(["a", "b"], sum)
            .unwrap();

        let value = task
            .call(args! { "a" => 4 })
            .unwrap()
            .compute(&ScopeStack::new())
            .unwrap();
        assert_eq!(value, Value::from(8));
    }

    #[test]
    fn test_resolver_runs_only_when_needed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let task = TaskDescriptor::builder()
            .param("a")
            .param_default("b", 1)
            .dependency("b", move |_: &BoundArguments| -> anyhow::Result<Arg> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arg::Value(Value::from(100)))
            })
            .run(["a", "b"], sum)
            .unwrap();

        task.call(args! { "a" => 1 }).unwrap();
        task.call(args! { "a" => 1, "b" => 5 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolver_error() {
        let task = TaskDescriptor::builder()
            .param("a")
            .dependency("b", |_: &BoundArguments| -> anyhow::Result<Arg> {
                anyhow::bail!("no center")
            })
            .run(["a", "b"], sum)
            .unwrap();

        let err = task.call(args! { "a" => 1 }).unwrap_err();
        assert!(matches!(err, DependencyResolutionError::Resolver { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_forward_builds_nested_task() {
        let inner_calls = Arc::new(AtomicUsize::new(0));
        let counter = inner_calls.clone();

        let inner = TaskDescriptor::builder()
            .name("inner")
            .param("a")
            .run(["a"], move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                let a: i64 = args.get_as("a")?;
                Ok(Value::from(a * 100))
            })
            .unwrap();

        let outer = TaskDescriptor::builder()
            .name("outer")
            .param("a")
            .dependency("b", inner.forward(["a"]))
            .run(["a", "b"], sum)
            .unwrap();

        let instance = outer.call(args! { "a" => 2 }).unwrap();
        assert!(instance.arguments().get("b").unwrap().as_node().is_some());

        let value = instance.compute(&ScopeStack::new()).unwrap();
        assert_eq!(value, Value::from(202));
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_encoder_changes_key_suffix() {
        let task = adder();
        let custom = task.with_encoder(Pipeline::builder().serializer(crate::encoding::Json).suffix("json").build());

        let a = task.call(args! { "a" => 1 }).unwrap();
        let b = custom.call(args! { "a" => 1 }).unwrap();

        assert!(!a.key().ends_with(".json"));
        assert!(b.key().ends_with(".json"));
        assert_eq!(a.key(), b.key().trim_end_matches(".json"));
    }

    #[test]
    fn test_run_error_carries_key() {
        let task = TaskDescriptor::builder()
            .name("failing")
            .param("a")
            .run(["a"], |_| anyhow::bail!("bad input"))
            .unwrap();

        let instance = task.call(args! { "a" => 1 }).unwrap();
        let mut stack = ScopeStack::new();
        let guard = stack.enter(Arc::new(MemoryStorage::new()), ScopeOptions::default());

        let err = instance.compute(&guard).unwrap_err();
        assert!(matches!(err, Error::Run { ref key, .. } if *key == instance.key()));
    }
}
