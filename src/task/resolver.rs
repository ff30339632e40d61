use crate::core::{Arg, BoundArguments, IntoArg, Value};
use crate::task::TaskDescriptor;

/// Computes the value of a dependency that the caller left unspecified.
///
/// A resolver sees every argument bound so far, in declaration order. It may
/// return a plain value or a deferred node, for example another task call.
pub trait Resolver: Send + Sync {
    fn resolve(&self, arguments: &BoundArguments) -> anyhow::Result<Arg>;
}

impl<F> Resolver for F
where
    F: Fn(&BoundArguments) -> anyhow::Result<Arg> + Send + Sync,
{
    fn resolve(&self, arguments: &BoundArguments) -> anyhow::Result<Arg> {
        self(arguments)
    }
}

/// Resolver that always yields the same value.
pub struct Constant(Value);

pub fn constant(value: impl Into<Value>) -> Constant {
    Constant(value.into())
}

impl Resolver for Constant {
    fn resolve(&self, _: &BoundArguments) -> anyhow::Result<Arg> {
        Ok(Arg::Value(self.0.clone()))
    }
}

/// Resolver that calls another task, forwarding some of the bound arguments.
///
/// Created with [`TaskDescriptor::forward`].
pub struct Forward {
    task: TaskDescriptor,
    names: Vec<String>,
}

impl Forward {
    pub(crate) fn new(task: TaskDescriptor, names: Vec<String>) -> Self {
        Self { task, names }
    }
}

impl Resolver for Forward {
    fn resolve(&self, arguments: &BoundArguments) -> anyhow::Result<Arg> {
        let mut forwarded = BoundArguments::new();

        for name in &self.names {
            let arg = arguments.get(name).ok_or_else(|| {
                anyhow::anyhow!(
                    "argument '{name}' is needed by '{}' but isn't bound yet",
                    self.task.name()
                )
            })?;
            forwarded.insert(name.clone(), arg.clone());
        }

        Ok(self.task.call(forwarded)?.into_arg())
    }
}
