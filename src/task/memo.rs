use std::sync::Arc;

use crate::core::{Arguments, Value};
use crate::encoding::Pipeline;
use crate::engine::Operation;
use crate::error::Error;
use crate::scope::Scope;
use crate::task::RunFn;

/// Where a bound argument takes its value from when the node runs.
pub(crate) enum Slot {
    Value(Value),
    /// Index into the node inputs.
    Input(usize),
}

/// Node operation wrapping a task's `run` with the storage lookup.
///
/// The lookup and the write are not atomic. Two nodes with the same key
/// running at the same time under the same storage may both miss and both
/// run, the later save wins.
pub(crate) struct Memoized {
    pub(crate) task: String,
    pub(crate) slots: Vec<(String, Slot)>,
    pub(crate) run: RunFn,
    pub(crate) save: bool,
    pub(crate) encoder: Arc<Pipeline>,
}

impl Memoized {
    fn arguments(&self, inputs: &[Value]) -> Arguments {
        self.slots
            .iter()
            .map(|(name, slot)| {
                let value = match slot {
                    Slot::Value(value) => value.clone(),
                    Slot::Input(index) => inputs[*index].clone(),
                };
                (name.as_str(), value)
            })
            .collect()
    }
}

impl Operation for Memoized {
    fn name(&self) -> &str {
        &self.task
    }

    fn execute(&self, key: &str, inputs: &[Value], scope: &Scope) -> Result<Value, Error> {
        if let Some(reader) = scope.reader() {
            // Absence is the only condition that leads to running the task,
            // unreadable bytes are an error.
            if let Some(bytes) = reader.load(key)? {
                tracing::debug!(key, size = bytes.len(), "cache hit");

                return self.encoder.decode(bytes).map_err(|source| Error::Decode {
                    key: key.to_string(),
                    source,
                });
            }

            tracing::debug!(key, "cache miss");
        }

        let arguments = self.arguments(inputs);
        let value = (self.run)(&arguments).map_err(|source| Error::Run {
            key: key.to_string(),
            source,
        })?;

        match scope.writer() {
            Some(writer) if self.save => {
                let bytes = self
                    .encoder
                    .encode(value.clone())
                    .map_err(|source| Error::Encode {
                        key: key.to_string(),
                        source,
                    })?;

                writer.save(key, &bytes)?;
                tracing::debug!(key, size = bytes.len(), "saved");
            }
            Some(_) => tracing::debug!(key, "task doesn't save, skipping write"),
            None => {}
        }

        Ok(value)
    }
}
