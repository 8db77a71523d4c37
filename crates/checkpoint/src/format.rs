//! On-disk formats for checkpoint artifacts

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use params::{checked_numel, DType, ParameterSet, ShardDescriptor, Tensor};
use runtime_core::{CheckpointId, CheckpointMetadata, Error, Rank, Result, TrainingProgress};

/// Magic bytes for tensor blobs
pub const TENSOR_MAGIC: [u8; 4] = *b"PTSR";

/// Tensor blob format version
pub const TENSOR_VERSION: u32 = 1;

/// Version of the directory layout and JSON documents
pub const FORMAT_VERSION: u32 = 1;

/// Prefix of staging directories
pub const STAGING_PREFIX: &str = ".tmp-";

pub const PROGRESS_FILE: &str = "progress.json";
pub const SCHEDULER_FILE: &str = "scheduler_state.bin";
pub const LIVE_DIR: &str = "live_params";
pub const SHADOW_DIR: &str = "shadow_params";
pub const OPTIMIZER_DIR: &str = "optimizer";
pub const MANIFEST_FILE: &str = "manifest.json";

pub fn staging_dir(id: &str) -> String {
    format!("{}{}", STAGING_PREFIX, id)
}

pub fn rank_file(rank: Rank) -> String {
    format!("rank-{:05}.bin", rank)
}

/// File name for one gathered parameter; the index keeps names unique
pub fn tensor_file(index: usize, name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{:04}-{}.bin", index, safe)
}

/// Contents of `progress.json`, written last into staging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFile {
    pub format_version: u32,
    pub checkpoint_id: CheckpointId,
    pub progress: TrainingProgress,
    pub world_size: usize,
    pub created_at: DateTime<Utc>,
    pub live_consolidated: bool,
}

impl ProgressFile {
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            id: self.checkpoint_id.clone(),
            progress: self.progress,
            world_size: self.world_size,
            path: self.checkpoint_id.clone(),
            created_at: self.created_at,
            live_consolidated: self.live_consolidated,
        }
    }
}

/// How a parameter directory stores its tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLayout {
    /// One bincode file per rank holding that rank's slices
    Sharded,
    /// One tensor blob per parameter holding the full tensor
    Gathered,
}

/// Contents of `live_params/manifest.json` and `shadow_params/manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamManifest {
    pub format_version: u32,
    pub layout: ParamLayout,
    pub world_size: usize,
    /// Descriptors in use when the checkpoint was saved
    pub descriptors: Vec<ShardDescriptor>,
    /// Parameter name to file, for gathered layouts
    #[serde(default)]
    pub files: Vec<(String, String)>,
}

/// One rank's slices of the live set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankShardFile {
    pub format_version: u32,
    pub rank: Rank,
    pub set: ParameterSet,
}

#[derive(Serialize)]
struct RankShardFileRef<'a> {
    format_version: u32,
    rank: Rank,
    set: &'a ParameterSet,
}

impl RankShardFile {
    /// Encode `set` without copying it
    pub fn encode(rank: Rank, set: &ParameterSet) -> Result<Bytes> {
        let file = RankShardFileRef {
            format_version: FORMAT_VERSION,
            rank,
            set,
        };
        Ok(Bytes::from(bincode::serialize(&file)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let file: RankShardFile = bincode::deserialize(bytes)?;
        if file.format_version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported shard file version {}",
                file.format_version
            )));
        }
        Ok(file)
    }
}

/// Encode a tensor as a self-describing blob
///
/// Layout: magic, version (u32), dtype (u8), ndim (u32), dims (u64 each),
/// numel (u64), then the elements as little-endian f32.
pub fn encode_tensor(tensor: &Tensor) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + tensor.shape().len() * 8 + tensor.numel() * 4);
    buf.put_slice(&TENSOR_MAGIC);
    buf.put_u32_le(TENSOR_VERSION);
    buf.put_u8(tensor.dtype().code());
    buf.put_u32_le(tensor.shape().len() as u32);
    for &dim in tensor.shape() {
        buf.put_u64_le(dim as u64);
    }
    buf.put_u64_le(tensor.numel() as u64);
    for &value in tensor.data() {
        buf.put_f32_le(value);
    }
    buf.freeze()
}

/// Decode a tensor blob, rejecting truncated or trailing bytes
pub fn decode_tensor(mut bytes: &[u8]) -> Result<Tensor> {
    fn need(bytes: &[u8], n: usize, what: &str) -> Result<()> {
        if bytes.remaining() < n {
            return Err(Error::Serialization(format!(
                "tensor blob truncated reading {}",
                what
            )));
        }
        Ok(())
    }

    need(bytes, 4, "magic")?;
    let mut magic = [0u8; 4];
    bytes.copy_to_slice(&mut magic);
    if magic != TENSOR_MAGIC {
        return Err(Error::Serialization("invalid tensor blob magic".to_string()));
    }

    need(bytes, 4 + 1 + 4, "header")?;
    let version = bytes.get_u32_le();
    if version != TENSOR_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported tensor blob version {}",
            version
        )));
    }
    let code = bytes.get_u8();
    if DType::from_code(code).is_none() {
        return Err(Error::Serialization(format!("unknown dtype code {}", code)));
    }

    let ndim = bytes.get_u32_le() as usize;
    need(bytes, ndim.saturating_mul(8).saturating_add(8), "shape")?;
    let shape: Vec<usize> = (0..ndim).map(|_| bytes.get_u64_le() as usize).collect();
    let numel = bytes.get_u64_le() as usize;

    let shape_numel = checked_numel(&shape).ok_or_else(|| {
        Error::Serialization(format!("tensor blob shape {:?} overflows", shape))
    })?;
    if shape_numel != numel {
        return Err(Error::Serialization(format!(
            "tensor blob shape {:?} holds {} elements, header declares {}",
            shape, shape_numel, numel
        )));
    }
    if numel.checked_mul(4) != Some(bytes.remaining()) {
        return Err(Error::Serialization(format!(
            "tensor blob holds {} data bytes, header declares {} elements",
            bytes.remaining(),
            numel
        )));
    }
    let data: Vec<f32> = (0..numel).map(|_| bytes.get_f32_le()).collect();

    Tensor::new(shape, data)
        .map_err(|e| Error::Serialization(format!("tensor blob inconsistent: {}", e)))
}
