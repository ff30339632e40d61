//! Cache key derivation.
//!
//! A cache key is `<task-name>/<digest>[.<suffix>]`. The digest comes from an
//! [`ArgumentHasher`] applied to the frozen bound arguments of a call. The
//! default, [`Tokenize`], walks every argument recursively into a canonical
//! byte stream and hashes it with BLAKE3, so two argument sets that are equal
//! by value always produce the same key.
//!
//! Arguments that are still deferred nodes are hashed by the node identity,
//! not by the value the node will eventually produce. Two call sites that
//! resolve to equal values through different nodes therefore don't share a
//! key.

use crate::core::{Arg, Blake3Hasher, BoundArguments, Hash32, Value};

/// Separator between task name and digest in a cache key.
pub const SEPARATOR: char = '/';

/// Turns a bound-argument set into a digest.
///
/// Implementations must be pure functions of their input. A hasher that reads
/// external mutable state voids every caching guarantee.
pub trait ArgumentHasher: Send + Sync {
    fn hash(&self, arguments: &BoundArguments) -> String;
}

impl<F> ArgumentHasher for F
where
    F: Fn(&BoundArguments) -> String + Send + Sync,
{
    fn hash(&self, arguments: &BoundArguments) -> String {
        self(arguments)
    }
}

/// Default hasher, BLAKE3 over the canonical encoding of all arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tokenize;

impl ArgumentHasher for Tokenize {
    fn hash(&self, arguments: &BoundArguments) -> String {
        tokenize(arguments)
    }
}

/// Hex BLAKE3 digest of the canonical encoding of `arguments`.
pub fn tokenize(arguments: &BoundArguments) -> String {
    let mut hasher = Blake3Hasher::default();
    hasher.update(&(arguments.len() as u64).to_le_bytes());

    for (name, arg) in arguments.iter() {
        hasher.update_framed(name.as_bytes());
        feed_arg(&mut hasher, arg);
    }

    Hash32::from(hasher).to_hex()
}

/// Hex BLAKE3 digest of a single value.
pub fn tokenize_value(value: &Value) -> String {
    let mut hasher = Blake3Hasher::default();
    feed_value(&mut hasher, value);
    Hash32::from(hasher).to_hex()
}

fn feed_arg(hasher: &mut Blake3Hasher, arg: &Arg) {
    match arg {
        Arg::Value(value) => {
            hasher.update(b"v");
            feed_value(hasher, value);
        }
        Arg::Node(node) => {
            hasher.update(b"n");
            hasher.update_framed(node.key().as_bytes());
        }
    }
}

pub(crate) fn feed_value(hasher: &mut Blake3Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"0");
        }
        Value::Bool(flag) => {
            hasher.update(b"?").update(&[*flag as u8]);
        }
        Value::Integer(integer) => {
            hasher.update(b"i").update(&i128::from(*integer).to_le_bytes());
        }
        Value::Float(float) => {
            // -0.0 == 0.0, so both must hash alike.
            let float = if *float == 0.0 { 0.0f64 } else { *float };
            hasher.update(b"f").update(&float.to_bits().to_le_bytes());
        }
        Value::Bytes(bytes) => {
            hasher.update(b"b").update_framed(bytes);
        }
        Value::Text(text) => {
            hasher.update(b"s").update_framed(text.as_bytes());
        }
        Value::Tag(tag, inner) => {
            hasher.update(b"t").update(&tag.to_le_bytes());
            feed_value(hasher, inner);
        }
        Value::Array(items) => {
            hasher
                .update(b"a")
                .update(&(items.len() as u64).to_le_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        Value::Map(entries) => {
            // Entry order doesn't matter for equality of mappings.
            let mut digests: Vec<Hash32> = entries
                .iter()
                .map(|(key, value)| {
                    let mut entry = Blake3Hasher::default();
                    feed_value(&mut entry, key);
                    feed_value(&mut entry, value);
                    Hash32::from(entry)
                })
                .collect();
            digests.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

            hasher
                .update(b"m")
                .update(&(digests.len() as u64).to_le_bytes());
            for digest in digests {
                hasher.update(digest.as_bytes());
            }
        }
        other => {
            hasher.update(b"x").update_framed(format!("{other:?}").as_bytes());
        }
    }
}

/// Hashes every argument except the named ones.
pub struct Exclude<H> {
    names: Vec<String>,
    inner: H,
}

/// Wraps `inner` so that the named arguments don't take part in the key.
pub fn exclude<H, I, S>(names: I, inner: H) -> Exclude<H>
where
    H: ArgumentHasher,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Exclude {
        names: names.into_iter().map(Into::into).collect(),
        inner,
    }
}

impl<H: ArgumentHasher> ArgumentHasher for Exclude<H> {
    fn hash(&self, arguments: &BoundArguments) -> String {
        let mut view = arguments.clone();
        view.retain(|name, _| !self.names.iter().any(|excluded| excluded == name));
        self.inner.hash(&view)
    }
}

/// Hashes only the named arguments.
pub struct Select<H> {
    names: Vec<String>,
    inner: H,
}

/// Wraps `inner` so that only the named arguments take part in the key.
pub fn select<H, I, S>(names: I, inner: H) -> Select<H>
where
    H: ArgumentHasher,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Select {
        names: names.into_iter().map(Into::into).collect(),
        inner,
    }
}

impl<H: ArgumentHasher> ArgumentHasher for Select<H> {
    fn hash(&self, arguments: &BoundArguments) -> String {
        let mut view = arguments.clone();
        view.retain(|name, _| self.names.iter().any(|selected| selected == name));
        self.inner.hash(&view)
    }
}

/// Derives a task name from the type name of its run callable.
///
/// `my_crate::stats::background` becomes `background`. Closure segments are
/// skipped, so a closure defined in `fn pipeline` is named `pipeline`.
pub fn function_name(type_name: &str) -> String {
    type_name
        .split("::")
        .filter(|segment| !segment.is_empty() && !segment.starts_with("{{"))
        .last()
        .unwrap_or(type_name)
        .to_string()
}

/// Joins task name, digest and optional pipeline suffix into a storage key.
pub fn cache_key(name: &str, digest: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{name}{SEPARATOR}{digest}.{suffix}"),
        None => format!("{name}{SEPARATOR}{digest}"),
    }
}
