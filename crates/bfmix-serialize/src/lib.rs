#![forbid(unsafe_code)]

//! Tensor and state-dict persistence.
//!
//! Encoding is a plain-access point: an engine-managed tensor is reverted to
//! its plain layout before its values are read, so a saved bf16-tagged f32
//! tensor holds the bf16-rounded values under its logical dtype. Loaded
//! tensors always own fresh plain storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::hash::Hasher;
use std::path::Path;

use bfmix_core::{DType, Device, Tensor, TensorError};
use bfmix_reorder::read_plain;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TENSOR_SCHEMA_VERSION: u32 = 1;
const MAX_PAYLOAD_BYTES: usize = 16 * 1_048_576;

const TENSOR_ENVELOPE_FIELDS: [&str; 3] = ["schema_version", "tensor", "source_hash"];
const STATE_DICT_ENVELOPE_FIELDS: [&str; 3] = ["schema_version", "entries", "source_hash"];

/// Logical content of one tensor. Elements are stored as f32 bit patterns so
/// non-finite values survive JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorRecord {
    pub dtype: DType,
    pub device: Device,
    pub shape: Vec<usize>,
    pub requires_grad: bool,
    pub bits: Vec<u32>,
}

impl TensorRecord {
    /// Reads `tensor` through a plain access.
    #[must_use]
    pub fn capture(tensor: &Tensor) -> Self {
        let values = read_plain(tensor);
        Self {
            dtype: tensor.dtype(),
            device: tensor.device(),
            shape: tensor.shape().to_vec(),
            requires_grad: tensor.requires_grad(),
            bits: values.iter().map(|value| value.to_bits()).collect(),
        }
    }

    #[must_use]
    pub fn values(&self) -> Vec<f32> {
        self.bits.iter().copied().map(f32::from_bits).collect()
    }

    pub fn to_tensor(&self) -> Result<Tensor, SerializeError> {
        let tensor = Tensor::new(&self.values(), self.shape.clone(), self.dtype, self.device)?;
        Ok(tensor.with_requires_grad(self.requires_grad))
    }

    fn validate(&self) -> Result<(), SerializeError> {
        let expected = self
            .shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| SerializeError::IncompatiblePayload {
                reason: format!("shape {:?} overflows", self.shape),
            })?;
        if expected != self.bits.len() {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!(
                    "shape {:?} needs {expected} elements, payload has {}",
                    self.shape,
                    self.bits.len()
                ),
            });
        }
        Ok(())
    }

    fn hash_into(&self, hasher: &mut Det64) {
        hasher.write_u8(match self.dtype {
            DType::F32 => 1,
            DType::BF16 => 2,
        });
        hasher.write_u8(match self.device {
            Device::Cpu => 1,
            Device::Xpu => 2,
        });
        hasher.write_u64(self.shape.len() as u64);
        for dim in &self.shape {
            hasher.write_u64(*dim as u64);
        }
        hasher.write_u8(u8::from(self.requires_grad));
        for bits in &self.bits {
            hasher.write_u32(*bits);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorEnvelope {
    pub schema_version: u32,
    pub tensor: TensorRecord,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: TensorRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDictEnvelope {
    pub schema_version: u32,
    pub entries: Vec<NamedTensor>,
    pub source_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Typed decode; the first serde error is reported.
    Strict,
    /// Structural checks on the raw JSON before the typed decode, with
    /// bounded diagnostics.
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
    DuplicateName { name: String },
    Tensor(TensorError),
    Io { path: String, reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
            Self::DuplicateName { name } => write!(f, "duplicate state-dict entry '{name}'"),
            Self::Tensor(error) => write!(f, "tensor rebuild failed: {error}"),
            Self::Io { path, reason } => write!(f, "io failure on '{path}': {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<TensorError> for SerializeError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

pub fn encode_tensor(tensor: &Tensor) -> Result<String, SerializeError> {
    let record = TensorRecord::capture(tensor);
    let source_hash = tensor_hash(TENSOR_SCHEMA_VERSION, &record);
    let envelope = TensorEnvelope {
        schema_version: TENSOR_SCHEMA_VERSION,
        tensor: record,
        source_hash,
    };
    to_json(&envelope, "tensor")
}

pub fn decode_tensor(input: &str, mode: DecodeMode) -> Result<Tensor, SerializeError> {
    validate_payload_size(input)?;
    let envelope: TensorEnvelope = decode_envelope(input, mode, &TENSOR_ENVELOPE_FIELDS)?;
    if envelope.schema_version != TENSOR_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: TENSOR_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }
    let expected = tensor_hash(envelope.schema_version, &envelope.tensor);
    verify_hash(expected, &envelope.source_hash)?;
    envelope.tensor.validate()?;
    envelope.tensor.to_tensor()
}

pub fn encode_state_dict(state: &BTreeMap<String, Tensor>) -> Result<String, SerializeError> {
    let entries: Vec<NamedTensor> = state
        .iter()
        .map(|(name, tensor)| NamedTensor {
            name: name.clone(),
            tensor: TensorRecord::capture(tensor),
        })
        .collect();
    let source_hash = state_dict_hash(TENSOR_SCHEMA_VERSION, &entries);
    let envelope = StateDictEnvelope {
        schema_version: TENSOR_SCHEMA_VERSION,
        entries,
        source_hash,
    };
    to_json(&envelope, "state dict")
}

pub fn decode_state_dict(
    input: &str,
    mode: DecodeMode,
) -> Result<BTreeMap<String, Tensor>, SerializeError> {
    validate_payload_size(input)?;
    let envelope: StateDictEnvelope =
        decode_envelope(input, mode, &STATE_DICT_ENVELOPE_FIELDS)?;
    if envelope.schema_version != TENSOR_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: TENSOR_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }
    let expected = state_dict_hash(envelope.schema_version, &envelope.entries);
    verify_hash(expected, &envelope.source_hash)?;

    let mut state = BTreeMap::new();
    for entry in envelope.entries {
        entry.tensor.validate()?;
        let tensor = entry.tensor.to_tensor()?;
        if state.insert(entry.name.clone(), tensor).is_some() {
            return Err(SerializeError::DuplicateName { name: entry.name });
        }
    }
    Ok(state)
}

pub fn save_tensor(tensor: &Tensor, path: impl AsRef<Path>) -> Result<(), SerializeError> {
    let payload = encode_tensor(tensor)?;
    write_file(path.as_ref(), &payload)
}

pub fn load_tensor(path: impl AsRef<Path>, mode: DecodeMode) -> Result<Tensor, SerializeError> {
    let payload = read_file(path.as_ref())?;
    decode_tensor(&payload, mode)
}

pub fn save_state_dict(
    state: &BTreeMap<String, Tensor>,
    path: impl AsRef<Path>,
) -> Result<(), SerializeError> {
    let payload = encode_state_dict(state)?;
    write_file(path.as_ref(), &payload)
}

pub fn load_state_dict(
    path: impl AsRef<Path>,
    mode: DecodeMode,
) -> Result<BTreeMap<String, Tensor>, SerializeError> {
    let payload = read_file(path.as_ref())?;
    decode_state_dict(&payload, mode)
}

fn write_file(path: &Path, payload: &str) -> Result<(), SerializeError> {
    fs::write(path, payload).map_err(|error| SerializeError::Io {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    tracing::debug!(
        target: "bfmix::serialize",
        path = %path.display(),
        bytes = payload.len(),
        "payload written"
    );
    Ok(())
}

fn read_file(path: &Path) -> Result<String, SerializeError> {
    fs::read_to_string(path).map_err(|error| SerializeError::Io {
        path: path.display().to_string(),
        reason: error.to_string(),
    })
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, SerializeError> {
    serde_json::to_string(value).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("{what} encoding failed: {error}"),
    })
}

fn decode_envelope<T: for<'de> Deserialize<'de>>(
    input: &str,
    mode: DecodeMode,
    allowed: &[&str],
) -> Result<T, SerializeError> {
    match mode {
        DecodeMode::Strict => serde_json::from_str(input).map_err(|error| {
            let message = error.to_string();
            match extract_unknown_field(&message) {
                Some(field) => SerializeError::UnknownField { field },
                None => SerializeError::InvalidJson {
                    diagnostic: bounded(&message, 200),
                },
            }
        }),
        DecodeMode::Hardened => {
            let raw: Value =
                serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
                    diagnostic: bounded(
                        &format!(
                            "{error}; payload_prefix={}",
                            bounded(&input.replace('\n', " "), 96)
                        ),
                        220,
                    ),
                })?;
            let obj = raw
                .as_object()
                .ok_or_else(|| SerializeError::IncompatiblePayload {
                    reason: "top-level payload must be a JSON object".to_string(),
                })?;
            let allowed: BTreeSet<&str> = allowed.iter().copied().collect();
            if let Some(field) = obj.keys().find(|key| !allowed.contains(key.as_str())) {
                return Err(SerializeError::UnknownField {
                    field: field.clone(),
                });
            }
            serde_json::from_value(raw).map_err(|error| SerializeError::IncompatiblePayload {
                reason: bounded(&error.to_string(), 200),
            })
        }
    }
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!("payload exceeds max bytes: actual={actual} max={MAX_PAYLOAD_BYTES}"),
        });
    }
    Ok(())
}

fn verify_hash(expected: String, found: &str) -> Result<(), SerializeError> {
    if found != expected {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: found.to_string(),
        });
    }
    Ok(())
}

fn tensor_hash(schema_version: u32, record: &TensorRecord) -> String {
    let mut hasher = Det64::default();
    hasher.write_u32(schema_version);
    record.hash_into(&mut hasher);
    format!("det64:{:016x}", hasher.finish())
}

fn state_dict_hash(schema_version: u32, entries: &[NamedTensor]) -> String {
    let mut hasher = Det64::default();
    hasher.write_u32(schema_version);
    hasher.write_u64(entries.len() as u64);
    for entry in entries {
        hasher.write(entry.name.as_bytes());
        hasher.write_u8(0xff);
        entry.tensor.hash_into(&mut hasher);
    }
    format!("det64:{:016x}", hasher.finish())
}

/// FNV-1a, 64 bit. Stable across platforms and runs.
struct Det64(u64);

impl Default for Det64 {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for Det64 {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn write_u32(&mut self, value: u32) {
        self.write(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut boundary = max_len;
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bfmix_core::{DType, Device, PhysicalRepr, Tensor, round_to_bf16};
    use bfmix_reorder::to_plan_bf16;
    use proptest::prelude::*;
    use serde_json::json;

    use super::{
        DecodeMode, SerializeError, decode_state_dict, decode_tensor, encode_state_dict,
        encode_tensor, load_state_dict, load_tensor, save_state_dict, save_tensor,
    };

    fn xpu(values: &[f32], shape: Vec<usize>) -> Tensor {
        Tensor::new(values, shape, DType::F32, Device::Xpu).expect("tensor")
    }

    fn tamper(payload: &str, edit: impl FnOnce(&mut serde_json::Value)) -> String {
        let mut value: serde_json::Value = serde_json::from_str(payload).expect("json");
        edit(&mut value);
        value.to_string()
    }

    #[test]
    fn plain_tensor_round_trip_strict() {
        let source = xpu(&[1.0, -2.5, 3.25, 0.0, 7.0, -0.125], vec![2, 3]).with_requires_grad(true);
        let payload = encode_tensor(&source).expect("encode");
        for mode in [DecodeMode::Strict, DecodeMode::Hardened] {
            let loaded = decode_tensor(&payload, mode).expect("decode");
            assert_eq!(loaded.shape(), &[2, 3]);
            assert_eq!(loaded.dtype(), DType::F32);
            assert_eq!(loaded.device(), Device::Xpu);
            assert!(loaded.requires_grad());
            assert_eq!(loaded.gather_f32(), source.gather_f32());
            assert!(!loaded.shares_storage(&source));
        }
    }

    #[test]
    fn tagged_tensor_saves_rounded_values_once() {
        let reference = [1.001f32, -3.14159, 65_504.5, 1e-3];
        let tagged = xpu(&reference, vec![4]);
        assert!(to_plan_bf16(&tagged).changed());
        let payload = encode_tensor(&tagged).expect("encode");
        assert!(!tagged.descriptor().managed_by_engine);

        let loaded = decode_tensor(&payload, DecodeMode::Strict).expect("decode");
        let expected: Vec<f32> = reference.iter().map(|v| round_to_bf16(*v)).collect();
        assert_eq!(loaded.gather_f32(), expected);
        assert_eq!(loaded.dtype(), DType::F32);
        assert_eq!(loaded.descriptor().physical_repr, PhysicalRepr::FullPrecision);
    }

    #[test]
    fn bf16_logical_dtype_survives() {
        let source = Tensor::new(&[0.5, 1.5], vec![2], DType::BF16, Device::Cpu).expect("bf16");
        let loaded = decode_tensor(&encode_tensor(&source).expect("encode"), DecodeMode::Strict)
            .expect("decode");
        assert_eq!(loaded.dtype(), DType::BF16);
        assert_eq!(loaded.device(), Device::Cpu);
        assert_eq!(loaded.gather_f32(), vec![0.5, 1.5]);
    }

    #[test]
    fn non_finite_values_survive() {
        let source = xpu(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY], vec![3]);
        let loaded = decode_tensor(&encode_tensor(&source).expect("encode"), DecodeMode::Strict)
            .expect("decode");
        let values = loaded.gather_f32();
        assert!(values[0].is_nan());
        assert_eq!(values[1], f32::INFINITY);
        assert_eq!(values[2], f32::NEG_INFINITY);
    }

    #[test]
    fn state_dict_round_trip_keeps_names() {
        let mut state = BTreeMap::new();
        state.insert("conv.weight".to_string(), xpu(&[1.0, 2.0, 3.0, 4.0], vec![2, 2]));
        state.insert("conv.bias".to_string(), xpu(&[0.5, -0.5], vec![2]));
        let payload = encode_state_dict(&state).expect("encode");
        let loaded = decode_state_dict(&payload, DecodeMode::Hardened).expect("decode");
        assert_eq!(
            loaded.keys().cloned().collect::<Vec<_>>(),
            vec!["conv.bias".to_string(), "conv.weight".to_string()]
        );
        assert_eq!(loaded["conv.weight"].shape(), &[2, 2]);
        assert_eq!(loaded["conv.bias"].gather_f32(), vec![0.5, -0.5]);
    }

    #[test]
    fn duplicate_state_dict_names_are_rejected() {
        let mut state = BTreeMap::new();
        state.insert("w".to_string(), xpu(&[1.0], vec![1]));
        let payload = encode_state_dict(&state).expect("encode");
        let mut envelope: super::StateDictEnvelope =
            serde_json::from_str(&payload).expect("envelope");
        let entry = envelope.entries[0].clone();
        envelope.entries.push(entry);
        let tampered = serde_json::to_string(&envelope).expect("json");
        assert!(matches!(
            decode_state_dict(&tampered, DecodeMode::Strict),
            Err(SerializeError::ChecksumMismatch { .. })
        ));

        envelope.source_hash = super::state_dict_hash(envelope.schema_version, &envelope.entries);
        let resealed = serde_json::to_string(&envelope).expect("json");
        let err = decode_state_dict(&resealed, DecodeMode::Strict).expect_err("dup");
        assert_eq!(
            err,
            SerializeError::DuplicateName {
                name: "w".to_string()
            }
        );
    }

    #[test]
    fn strict_unknown_field_fail_closed() {
        let payload = encode_tensor(&xpu(&[1.0], vec![1])).expect("encode");
        let tampered = tamper(&payload, |value| {
            value["extra"] = json!(1);
        });
        let err = decode_tensor(&tampered, DecodeMode::Strict).expect_err("unknown field");
        assert_eq!(
            err,
            SerializeError::UnknownField {
                field: "extra".to_string()
            }
        );
        let err = decode_tensor(&tampered, DecodeMode::Hardened).expect_err("unknown field");
        assert!(matches!(err, SerializeError::UnknownField { field } if field == "extra"));
    }

    #[test]
    fn version_mismatch_is_fail_closed() {
        let payload = encode_tensor(&xpu(&[1.0], vec![1])).expect("encode");
        let tampered = tamper(&payload, |value| {
            value["schema_version"] = json!(99);
        });
        assert_eq!(
            decode_tensor(&tampered, DecodeMode::Strict).expect_err("version"),
            SerializeError::VersionMismatch {
                expected: 1,
                found: 99
            }
        );
    }

    #[test]
    fn checksum_mismatch_is_fail_closed() {
        let payload = encode_tensor(&xpu(&[1.0, 2.0], vec![2])).expect("encode");
        let tampered = tamper(&payload, |value| {
            value["tensor"]["bits"][0] = json!(0);
        });
        assert!(matches!(
            decode_tensor(&tampered, DecodeMode::Strict),
            Err(SerializeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn hardened_rejects_non_object_and_bounds_diagnostics() {
        assert!(matches!(
            decode_tensor("[1, 2, 3]", DecodeMode::Hardened),
            Err(SerializeError::IncompatiblePayload { .. })
        ));
        let garbage = format!("{{{}", "x".repeat(4096));
        match decode_tensor(&garbage, DecodeMode::Hardened) {
            Err(SerializeError::InvalidJson { diagnostic }) => {
                assert!(diagnostic.len() <= 223);
            }
            other => panic!("expected invalid json, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_is_fail_closed() {
        let oversized = " ".repeat(super::MAX_PAYLOAD_BYTES + 1);
        assert!(matches!(
            decode_tensor(&oversized, DecodeMode::Strict),
            Err(SerializeError::IncompatiblePayload { .. })
        ));
    }

    #[test]
    fn files_round_trip() {
        let dir = std::env::temp_dir().join(format!("bfmix-serialize-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let tensor_path = dir.join("tensor.json");
        let state_path = dir.join("state.json");

        let source = xpu(&[1.0, 2.0, 3.0], vec![3]);
        save_tensor(&source, &tensor_path).expect("save");
        let loaded = load_tensor(&tensor_path, DecodeMode::Strict).expect("load");
        assert_eq!(loaded.gather_f32(), source.gather_f32());

        let mut state = BTreeMap::new();
        state.insert("w".to_string(), source);
        save_state_dict(&state, &state_path).expect("save state");
        let restored = load_state_dict(&state_path, DecodeMode::Strict).expect("load state");
        assert_eq!(restored.len(), 1);

        let missing = load_tensor(dir.join("missing.json"), DecodeMode::Strict);
        assert!(matches!(missing, Err(SerializeError::Io { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn error_display_is_descriptive() {
        let err = SerializeError::DuplicateName {
            name: "w".to_string(),
        };
        assert!(err.to_string().contains("'w'"));
        let err = SerializeError::Io {
            path: "/tmp/x".to_string(),
            reason: "denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/x"));
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_bit_exact(values in proptest::collection::vec(any::<f32>(), 1..48)) {
            let len = values.len();
            let source = xpu(&values, vec![len]);
            let payload = encode_tensor(&source).expect("encode");
            let loaded = decode_tensor(&payload, DecodeMode::Strict).expect("decode");
            let before: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
            let after: Vec<u32> = loaded.gather_f32().iter().map(|v| v.to_bits()).collect();
            prop_assert_eq!(before, after);
        }

        #[test]
        fn prop_encoding_is_deterministic(len in 1usize..32, seed in 0u32..1000) {
            let values: Vec<f32> = (0..len).map(|i| (i as u32 ^ seed) as f32 * 0.5).collect();
            let source = xpu(&values, vec![len]);
            prop_assert_eq!(
                encode_tensor(&source).expect("first"),
                encode_tensor(&source).expect("second")
            );
        }
    }
}
