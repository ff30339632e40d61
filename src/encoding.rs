//! Invertible transformation between task results and stored bytes.
//!
//! A [`Pipeline`] has four slots which run in a fixed order when encoding:
//!
//! ```text
//! transform -> ... -> transform -> serialize -> compress -> encrypt
//! ```
//!
//! and in exactly the reverse order when decoding. Every slot may be empty,
//! in which case it is the identity. Without a serializer the pipeline only
//! accepts [`Value::Bytes`], which are passed through unchanged.

use std::fmt::Debug;
use std::sync::Arc;

use crate::core::Value;
use crate::error::{DecodeError, EncodeError};

/// Value to value stage, applied before serialization.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, value: Value) -> anyhow::Result<Value>;
    fn decode(&self, value: Value) -> anyhow::Result<Value>;
}

/// Value to bytes stage.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &str;
    fn serialize(&self, value: &Value) -> anyhow::Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<Value>;
}

/// Bytes to bytes stage, used for both compression and encryption.
pub trait ByteStage: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>>;
    fn decode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// CBOR serializer backed by `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cbor;

impl Serializer for Cbor {
    fn name(&self) -> &str {
        "cbor"
    }

    fn serialize(&self, value: &Value) -> anyhow::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer)?;
        Ok(buffer)
    }

    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<Value> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// JSON serializer.
///
/// Only values representable in JSON survive a round trip: byte strings come
/// back as arrays of numbers and tags are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Serializer for Json {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize(&self, value: &Value) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Zstandard compressor.
#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy)]
pub struct Zstd {
    pub level: i32,
}

#[cfg(feature = "zstd")]
impl Default for Zstd {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "zstd")]
impl ByteStage for Zstd {
    fn name(&self) -> &str {
        "zstd"
    }

    fn encode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::stream::encode_all(bytes.as_slice(), self.level)?)
    }

    fn decode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::stream::decode_all(bytes.as_slice())?)
    }
}

type ValueFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;
type BytesFn = dyn Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync;

/// [`Transform`] assembled from a pair of closures.
pub struct FnTransform {
    name: String,
    encode: Box<ValueFn>,
    decode: Box<ValueFn>,
}

/// Builds a value transform from an `encode` and its inverse `decode`.
pub fn transform<E, D>(name: impl Into<String>, encode: E, decode: D) -> FnTransform
where
    E: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    D: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    FnTransform {
        name: name.into(),
        encode: Box::new(encode),
        decode: Box::new(decode),
    }
}

impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, value: Value) -> anyhow::Result<Value> {
        (self.encode)(value)
    }

    fn decode(&self, value: Value) -> anyhow::Result<Value> {
        (self.decode)(value)
    }
}

/// [`ByteStage`] assembled from a pair of closures.
pub struct FnByteStage {
    name: String,
    encode: Box<BytesFn>,
    decode: Box<BytesFn>,
}

/// Builds a byte stage (compressor or encrypter) from a pair of closures.
pub fn byte_stage<E, D>(name: impl Into<String>, encode: E, decode: D) -> FnByteStage
where
    E: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    D: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
{
    FnByteStage {
        name: name.into(),
        encode: Box::new(encode),
        decode: Box::new(decode),
    }
}

impl ByteStage for FnByteStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        (self.encode)(bytes)
    }

    fn decode(&self, bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        (self.decode)(bytes)
    }
}

/// Ordered, invertible value to bytes pipeline.
///
/// Pipelines are immutable once built and cheap to clone, they are shared by
/// every call of the task that owns them.
#[derive(Clone)]
pub struct Pipeline {
    transforms: Vec<Arc<dyn Transform>>,
    serializer: Option<Arc<dyn Serializer>>,
    compressor: Option<Arc<dyn ByteStage>>,
    encrypter: Option<Arc<dyn ByteStage>>,
    suffix: Option<String>,
}

impl Pipeline {
    /// Starts from an empty pipeline, every slot is the identity.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            pipeline: Pipeline::identity(),
        }
    }

    /// Pipeline that stores byte values verbatim.
    pub fn identity() -> Self {
        Self {
            transforms: Vec::new(),
            serializer: None,
            compressor: None,
            encrypter: None,
            suffix: None,
        }
    }

    /// Suffix appended to cache keys of tasks using this pipeline.
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Names of all configured stages in encoding order.
    pub fn stages(&self) -> Vec<&str> {
        self.transforms
            .iter()
            .map(|stage| stage.name())
            .chain(self.serializer.iter().map(|stage| stage.name()))
            .chain(self.compressor.iter().map(|stage| stage.name()))
            .chain(self.encrypter.iter().map(|stage| stage.name()))
            .collect()
    }

    pub fn encode(&self, value: Value) -> Result<Vec<u8>, EncodeError> {
        let mut value = value;
        for stage in &self.transforms {
            value = stage.encode(value).map_err(|source| EncodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?;
        }

        let mut bytes = match &self.serializer {
            Some(stage) => stage.serialize(&value).map_err(|source| EncodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?,
            None => match value {
                Value::Bytes(bytes) => bytes,
                _ => return Err(EncodeError::NotBytes),
            },
        };

        for stage in self.compressor.iter().chain(&self.encrypter) {
            bytes = stage.encode(bytes).map_err(|source| EncodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?;
        }

        Ok(bytes)
    }

    pub fn decode(&self, bytes: Vec<u8>) -> Result<Value, DecodeError> {
        let mut bytes = bytes;
        for stage in self.encrypter.iter().chain(&self.compressor) {
            bytes = stage.decode(bytes).map_err(|source| DecodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?;
        }

        let mut value = match &self.serializer {
            Some(stage) => stage.deserialize(&bytes).map_err(|source| DecodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?,
            None => Value::Bytes(bytes),
        };

        for stage in self.transforms.iter().rev() {
            value = stage.decode(value).map_err(|source| DecodeError::Stage {
                stage: stage.name().to_string(),
                source,
            })?;
        }

        Ok(value)
    }
}

impl Default for Pipeline {
    /// CBOR, followed by zstd compression when the `zstd` feature is enabled.
    fn default() -> Self {
        let builder = Pipeline::builder().serializer(Cbor);
        #[cfg(feature = "zstd")]
        let builder = builder.compressor(Zstd::default());
        builder.build()
    }
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages())
            .field("suffix", &self.suffix)
            .finish()
    }
}

/// Configures a [`Pipeline`] slot by slot.
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    /// Appends an element transform; transforms run in insertion order.
    pub fn transform(mut self, stage: impl Transform + 'static) -> Self {
        self.pipeline.transforms.push(Arc::new(stage));
        self
    }

    pub fn serializer(mut self, stage: impl Serializer + 'static) -> Self {
        self.pipeline.serializer = Some(Arc::new(stage));
        self
    }

    pub fn compressor(mut self, stage: impl ByteStage + 'static) -> Self {
        self.pipeline.compressor = Some(Arc::new(stage));
        self
    }

    pub fn encrypter(mut self, stage: impl ByteStage + 'static) -> Self {
        self.pipeline.encrypter = Some(Arc::new(stage));
        self
    }

    /// Distinguishes keys of tasks that share a name but not a pipeline.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.pipeline.suffix = Some(suffix.into());
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn xor(key: u8) -> FnByteStage {
        byte_stage(
            "xor",
            move |bytes| Ok(bytes.into_iter().map(|b| b ^ key).collect()),
            move |bytes| Ok(bytes.into_iter().map(|b| b ^ key).collect()),
        )
    }

    fn sample() -> Value {
        Value::Map(vec![
            (Value::from("name"), Value::from("kioku")),
            (
                Value::from("data"),
                Value::Array(vec![Value::from(1), Value::from(2.5), Value::Null]),
            ),
            (Value::from("raw"), Value::Bytes(vec![0, 1, 2, 255])),
        ])
    }

    #[test]
    fn test_default_round_trip() {
        let pipeline = Pipeline::default();
        let bytes = pipeline.encode(sample()).unwrap();
        assert_eq!(pipeline.decode(bytes).unwrap(), sample());
    }

    #[test]
    fn test_identity_passes_bytes_through() {
        let pipeline = Pipeline::identity();
        let bytes = pipeline.encode(Value::Bytes(b"abc".to_vec())).unwrap();
        assert_eq!(bytes, b"abc");
        assert_eq!(pipeline.decode(bytes).unwrap(), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn test_identity_rejects_non_bytes() {
        let err = Pipeline::identity().encode(Value::from(1)).unwrap_err();
        assert!(matches!(err, EncodeError::NotBytes));
    }

    #[test]
    fn test_encrypter_is_applied_last() {
        let plain = Pipeline::builder().serializer(Cbor).build();
        let secret = Pipeline::builder().serializer(Cbor).encrypter(xor(0x5a)).build();

        let a = plain.encode(sample()).unwrap();
        let b = secret.encode(sample()).unwrap();
        assert_eq!(a.iter().map(|x| x ^ 0x5a).collect::<Vec<_>>(), b);
        assert_eq!(secret.decode(b).unwrap(), sample());
    }

    #[test]
    fn test_transforms_decode_in_reverse() {
        // wrap(x) = [tag, x]; applying "a" then "b" must unwrap "b" first.
        let wrap = |tag: &'static str| {
            transform(
                tag,
                move |value| Ok(Value::Array(vec![Value::from(tag), value])),
                move |value| match value {
                    Value::Array(mut items) if items.len() == 2 && items[0] == Value::from(tag) => {
                        Ok(items.remove(1))
                    }
                    other => anyhow::bail!("stage {tag} got {other:?}"),
                },
            )
        };

        let pipeline = Pipeline::builder()
            .transform(wrap("a"))
            .transform(wrap("b"))
            .serializer(Cbor)
            .build();

        let bytes = pipeline.encode(Value::from(7)).unwrap();
        assert_eq!(pipeline.decode(bytes).unwrap(), Value::from(7));
        assert_eq!(pipeline.stages(), vec!["a", "b", "cbor"]);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_corrupt_bytes_fail_to_decode() {
        let pipeline = Pipeline::default();
        let err = pipeline.decode(b"definitely not a frame".to_vec()).unwrap_err();
        assert!(matches!(err, DecodeError::Stage { .. }));
    }

    #[test]
    fn test_json_round_trip() {
        let pipeline = Pipeline::builder().serializer(Json).suffix("json").build();
        let value = Value::Map(vec![(Value::from("x"), Value::from(42))]);
        let bytes = pipeline.encode(value.clone()).unwrap();
        assert_eq!(bytes, br#"{"x":42}"#);
        assert_eq!(pipeline.decode(bytes).unwrap(), value);
        assert_eq!(pipeline.suffix(), Some("json"));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<f64>()
                .prop_filter("NaN never equals itself", |f| !f.is_nan())
                .prop_map(Value::from),
            ".*".prop_map(Value::from),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::from),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                proptest::collection::vec((".{0,8}".prop_map(Value::from), inner), 0..6)
                    .prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip(value in tree()) {
            let pipeline = Pipeline::builder()
                .serializer(Cbor)
                .encrypter(xor(0xa5))
                .build();
            let bytes = pipeline.encode(value.clone()).unwrap();
            prop_assert_eq!(pipeline.decode(bytes).unwrap(), value);
        }
    }
}
