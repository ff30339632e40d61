use serde::de::DeserializeOwned;

use crate::engine::Node;
use crate::task::TaskInstance;

/// Dynamically typed value flowing through the graph.
///
/// Task arguments and results are CBOR data model values, which is also the
/// shape the default serializer writes to storage.
pub use ciborium::Value;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `kioku` this is the digest behind every cache key produced by the
/// default hasher, and the identity of pure graph nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental BLAKE3 state used to derive digests from structured input.
#[derive(Default, Clone)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Writes a byte string prefixed by its length, so adjacent fields can't
    /// bleed into each other.
    pub(crate) fn update_framed(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// An argument bound to a task call: either a concrete value or a deferred
/// node whose value the graph engine will supply before execution.
#[derive(Clone, Debug)]
pub enum Arg {
    Value(Value),
    Node(Node),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(value) => Some(value),
            Arg::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Arg::Value(_) => None,
            Arg::Node(node) => Some(node),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Node> for Arg {
    fn from(node: Node) -> Self {
        Arg::Node(node)
    }
}

impl From<&Node> for Arg {
    fn from(node: &Node) -> Self {
        Arg::Node(node.clone())
    }
}

/// Conversion used by [`Arguments::with`] and the [`args!`](crate::args) macro.
pub trait IntoArg {
    fn into_arg(self) -> Arg;
}

impl IntoArg for Arg {
    fn into_arg(self) -> Arg {
        self
    }
}

impl IntoArg for Node {
    fn into_arg(self) -> Arg {
        Arg::Node(self)
    }
}

impl IntoArg for &Node {
    fn into_arg(self) -> Arg {
        Arg::Node(self.clone())
    }
}

impl IntoArg for TaskInstance {
    fn into_arg(self) -> Arg {
        Arg::Node(self.node())
    }
}

impl IntoArg for &TaskInstance {
    fn into_arg(self) -> Arg {
        Arg::Node(self.node())
    }
}

macro_rules! impl_into_arg {
    ($($T:ty),*) => {
        $(
            impl IntoArg for $T {
                fn into_arg(self) -> Arg {
                    Arg::Value(Value::from(self))
                }
            }
        )*
    };
}

impl_into_arg!(Value, bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, &str, Vec<u8>);

/// Ordered name to value mapping.
///
/// Insertion order is preserved, and re-inserting an existing name replaces the
/// value in place, so the order always reflects first declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct Arguments<T = Value> {
    entries: Vec<(String, T)>,
}

/// Arguments of a task call before the graph engine resolved its nodes.
pub type BoundArguments = Arguments<Arg>;

impl<T> Arguments<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Inserts a value, returning the previous one if the name was present.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Option<T> {
        let name = name.into();

        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let index = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &T) -> bool) {
        self.entries.retain(|(key, value)| keep(key, value));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl Arguments<Arg> {
    /// Builder-style insert used to assemble explicit call arguments.
    pub fn with(mut self, name: impl Into<String>, value: impl IntoArg) -> Self {
        self.insert(name, value.into_arg());
        self
    }
}

impl Arguments<Value> {
    /// Returns the named value or an error suitable for a task body.
    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'"))
    }

    /// Deserializes the named value into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        self.require(name)?
            .deserialized()
            .map_err(|err| anyhow::anyhow!("argument '{name}': {err}"))
    }
}

impl<T> Default for Arguments<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> FromIterator<(K, T)> for Arguments<T>
where
    K: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut arguments = Self::new();
        for (name, value) in iter {
            arguments.insert(name, value);
        }
        arguments
    }
}

impl<T> IntoIterator for Arguments<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Builds [`BoundArguments`] from `name => value` pairs.
///
/// ```
/// let args = kioku::args! { "x" => 21, "label" => "a" };
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::BoundArguments::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::BoundArguments::new()$(.with($name, $value))+
    };
}
