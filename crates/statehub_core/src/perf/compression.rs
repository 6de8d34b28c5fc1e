//! # State Compression
//!
//! Three interchangeable encodings for JSON state:
//!
//! * [`CompressionAlgorithm::Json`] replaces repeated object keys with short
//!   dictionary references (`~0`, `~1`, ...). Literal keys starting with `~`
//!   are escaped by doubling the tilde.
//! * [`CompressionAlgorithm::Binary`] run-length encodes the serialised bytes
//!   and transports them as base64.
//! * [`CompressionAlgorithm::Diff`] records the structural changes against a
//!   previous value. Decompression needs that same previous value; the payload
//!   carries its checksum so a wrong base is rejected.
//!
//! Values whose serialised size is below `threshold` pass through unchanged.

use crate::error::CompressionError;
use crate::events::CompressionApplied;
use crate::utils::checksum;
use crate::EventBus;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Json,
    Binary,
    Diff,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionAlgorithm::Json => "json",
            CompressionAlgorithm::Binary => "binary",
            CompressionAlgorithm::Diff => "diff",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    /// Serialised size in bytes below which values pass through
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Json,
            threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedPayload {
    pub algorithm: CompressionAlgorithm,
    /// `false` when the value was below the threshold and `payload` is plain JSON
    pub compressed: bool,
    pub payload: String,
    pub original_size: usize,
    pub compressed_size: usize,
}

impl CompressedPayload {
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }
}

pub struct StateCompressor {
    config: CompressionConfig,
    bus: Option<EventBus>,
}

impl StateCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config, bus: None }
    }

    /// Reports every compression on `bus`.
    pub fn with_bus(mut self, bus: &EventBus) -> Self {
        self.bus = Some(bus.clone());
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Encodes `data`. `previous` is the base for the diff algorithm and
    /// ignored by the others.
    pub fn compress(&self, data: &Value, previous: Option<&Value>) -> Result<CompressedPayload, CompressionError> {
        let serialized = serde_json::to_string(data)?;
        let original_size = serialized.len();
        let algorithm = self.config.algorithm;

        let (compressed, payload) = if original_size < self.config.threshold {
            (false, serialized)
        } else {
            let payload = match algorithm {
                CompressionAlgorithm::Json => dictionary::encode(data)?,
                CompressionAlgorithm::Binary => rle::encode(serialized.as_bytes()),
                CompressionAlgorithm::Diff => diff::encode(previous, data)?,
            };
            (true, payload)
        };

        let result = CompressedPayload {
            algorithm,
            compressed,
            compressed_size: payload.len(),
            payload,
            original_size,
        };
        debug!(
            "🗜️ {} compression: {} -> {} bytes",
            algorithm, result.original_size, result.compressed_size
        );
        self.report(&result);
        Ok(result)
    }

    /// Decodes a payload produced by a compressor with the same algorithm.
    pub fn decompress(&self, payload: &CompressedPayload, previous: Option<&Value>) -> Result<Value, CompressionError> {
        if payload.algorithm != self.config.algorithm {
            return Err(CompressionError::AlgorithmMismatch {
                payload: payload.algorithm.to_string(),
                expected: self.config.algorithm.to_string(),
            });
        }
        if !payload.compressed {
            return Ok(serde_json::from_str(&payload.payload)?);
        }
        match payload.algorithm {
            CompressionAlgorithm::Json => dictionary::decode(&payload.payload),
            CompressionAlgorithm::Binary => rle::decode(&payload.payload),
            CompressionAlgorithm::Diff => diff::decode(&payload.payload, previous),
        }
    }

    fn report(&self, result: &CompressedPayload) {
        if let Some(bus) = &self.bus {
            let event = CompressionApplied {
                algorithm: result.algorithm.to_string(),
                original_size: result.original_size,
                compressed_size: result.compressed_size,
                compressed: result.compressed,
            };
            if let Err(e) = bus.emit(event, Some("state-compressor")) {
                warn!("⚠️ Failed to report compression: {}", e);
            }
        }
    }
}

mod dictionary {
    use super::*;

    const MARKER: char = '~';
    const MIN_KEY_LEN: usize = 4;

    #[derive(Serialize, Deserialize)]
    struct Encoded {
        #[serde(rename = "d")]
        dictionary: Vec<String>,
        #[serde(rename = "v")]
        value: Value,
    }

    pub(super) fn encode(data: &Value) -> Result<String, CompressionError> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        count_keys(data, &mut counts);

        let mut dictionary: Vec<String> = counts
            .into_iter()
            .filter(|(key, count)| *count > 1 && key.len() >= MIN_KEY_LEN)
            .map(|(key, _)| key.to_string())
            .collect();
        dictionary.sort();
        let index: HashMap<&str, usize> = dictionary
            .iter()
            .enumerate()
            .map(|(i, key)| (key.as_str(), i))
            .collect();

        let value = rename_keys(data, &|key: &str| match index.get(key) {
            Some(i) => format!("{MARKER}{i}"),
            None if key.starts_with(MARKER) => format!("{MARKER}{key}"),
            None => key.to_string(),
        });
        drop(index);
        Ok(serde_json::to_string(&Encoded { dictionary, value })?)
    }

    pub(super) fn decode(payload: &str) -> Result<Value, CompressionError> {
        let encoded: Encoded = serde_json::from_str(payload)
            .map_err(|e| CompressionError::Malformed(format!("dictionary payload: {e}")))?;
        restore_keys(&encoded.value, &encoded.dictionary)
    }

    fn count_keys<'a>(value: &'a Value, counts: &mut HashMap<&'a str, usize>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    *counts.entry(key.as_str()).or_default() += 1;
                    count_keys(child, counts);
                }
            }
            Value::Array(items) => items.iter().for_each(|item| count_keys(item, counts)),
            _ => {}
        }
    }

    fn rename_keys(value: &Value, rename: &dyn Fn(&str) -> String) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, child)| (rename(key), rename_keys(child, rename)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|item| rename_keys(item, rename)).collect()),
            other => other.clone(),
        }
    }

    fn restore_keys(value: &Value, dictionary: &[String]) -> Result<Value, CompressionError> {
        match value {
            Value::Object(map) => {
                let mut restored = Map::with_capacity(map.len());
                for (key, child) in map {
                    restored.insert(restore_key(key, dictionary)?, restore_keys(child, dictionary)?);
                }
                Ok(Value::Object(restored))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| restore_keys(item, dictionary))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn restore_key(key: &str, dictionary: &[String]) -> Result<String, CompressionError> {
        let Some(rest) = key.strip_prefix(MARKER) else {
            return Ok(key.to_string());
        };
        if rest.starts_with(MARKER) {
            return Ok(rest.to_string());
        }
        rest.parse::<usize>()
            .ok()
            .and_then(|i| dictionary.get(i))
            .cloned()
            .ok_or_else(|| CompressionError::Malformed(format!("unknown dictionary reference '{key}'")))
    }
}

mod rle {
    use super::*;

    /// `(run length, byte)` pairs, base64 encoded.
    pub(super) fn encode(bytes: &[u8]) -> String {
        let mut out = Vec::with_capacity(bytes.len());
        let mut iter = bytes.iter().peekable();
        while let Some(&byte) = iter.next() {
            let mut run: u8 = 1;
            while run < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }
        STANDARD.encode(out)
    }

    pub(super) fn decode(payload: &str) -> Result<Value, CompressionError> {
        let raw = STANDARD
            .decode(payload)
            .map_err(|e| CompressionError::Malformed(format!("invalid base64: {e}")))?;
        if raw.len() % 2 != 0 {
            return Err(CompressionError::Malformed("truncated run-length pair".into()));
        }

        let mut bytes = Vec::with_capacity(raw.len());
        for pair in raw.chunks_exact(2) {
            if pair[0] == 0 {
                return Err(CompressionError::Malformed("zero-length run".into()));
            }
            bytes.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        let text = String::from_utf8(bytes)
            .map_err(|e| CompressionError::Malformed(format!("decoded bytes are not UTF-8: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }
}

mod diff {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "op", rename_all = "lowercase")]
    enum DiffOp {
        Set { path: Vec<String>, value: Value },
        Remove { path: Vec<String> },
    }

    #[derive(Serialize, Deserialize)]
    struct Encoded {
        /// Checksum of the previous value, absent for a full snapshot
        base: Option<String>,
        ops: Vec<DiffOp>,
    }

    pub(super) fn encode(previous: Option<&Value>, data: &Value) -> Result<String, CompressionError> {
        let mut ops = Vec::new();
        let base = match previous {
            Some(previous) => {
                diff_values(previous, data, &mut Vec::new(), &mut ops);
                Some(checksum(previous))
            }
            None => {
                ops.push(DiffOp::Set {
                    path: Vec::new(),
                    value: data.clone(),
                });
                None
            }
        };
        Ok(serde_json::to_string(&Encoded { base, ops })?)
    }

    pub(super) fn decode(payload: &str, previous: Option<&Value>) -> Result<Value, CompressionError> {
        let encoded: Encoded = serde_json::from_str(payload)
            .map_err(|e| CompressionError::Malformed(format!("diff payload: {e}")))?;

        let mut value = match (&encoded.base, previous) {
            (None, _) => Value::Null,
            (Some(_), None) => return Err(CompressionError::MissingBase),
            (Some(expected), Some(previous)) => {
                let actual = checksum(previous);
                if *expected != actual {
                    return Err(CompressionError::BaseMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
                previous.clone()
            }
        };

        for op in encoded.ops {
            apply(&mut value, op)?;
        }
        Ok(value)
    }

    fn diff_values(old: &Value, new: &Value, path: &mut Vec<String>, ops: &mut Vec<DiffOp>) {
        match (old, new) {
            (Value::Object(old_map), Value::Object(new_map)) => {
                for key in old_map.keys().filter(|key| !new_map.contains_key(*key)) {
                    let mut removed = path.clone();
                    removed.push(key.clone());
                    ops.push(DiffOp::Remove { path: removed });
                }
                for (key, new_child) in new_map {
                    path.push(key.clone());
                    match old_map.get(key) {
                        Some(old_child) => diff_values(old_child, new_child, path, ops),
                        None => ops.push(DiffOp::Set {
                            path: path.clone(),
                            value: new_child.clone(),
                        }),
                    }
                    path.pop();
                }
            }
            _ if old == new => {}
            _ => ops.push(DiffOp::Set {
                path: path.clone(),
                value: new.clone(),
            }),
        }
    }

    fn apply(root: &mut Value, op: DiffOp) -> Result<(), CompressionError> {
        let (path, value) = match op {
            DiffOp::Set { path, value } => (path, Some(value)),
            DiffOp::Remove { path } => (path, None),
        };

        let Some((last, parents)) = path.split_last() else {
            *root = value.ok_or_else(|| CompressionError::Malformed("cannot remove the root".into()))?;
            return Ok(());
        };

        let mut target = root;
        for segment in parents {
            target = target
                .get_mut(segment.as_str())
                .ok_or_else(|| CompressionError::Malformed(format!("diff path segment '{segment}' not found")))?;
        }
        let map = target
            .as_object_mut()
            .ok_or_else(|| CompressionError::Malformed(format!("diff path parent of '{last}' is not an object")))?;
        match value {
            Some(value) => {
                map.insert(last.clone(), value);
            }
            None => {
                map.remove(last);
            }
        }
        Ok(())
    }
}
