//! On-disk model artifacts
//!
//! A published generation is written as one directory:
//!
//! ```text
//! <root>/
//!   LOCK                     exclusive lock held while saving
//!   CURRENT                  name of the live model directory
//!   models/
//!     00000000000000000007/
//!       users.vec            user vectors   (MessagePack)
//!       users.bias           user biases    (MessagePack)
//!       items.vec            item vectors, index order
//!       items.bias           item biases
//!       index.hnsw           serialized ANN graph
//!       MANIFEST             magic + version + MessagePack manifest
//! ```
//!
//! The model directory is fully written and fsynced before `CURRENT` is
//! replaced via temp + fsync + rename, so a reader sees either the old
//! model or the new one, never a mix. The manifest carries a CRC32 for each
//! table file; a mismatch on load is reported as corruption.
//!
//! Vector and bias tables are stored separately. A row present in the
//! vector table but missing from the bias table loads with bias 0.0.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use latent_core::{
    Factor, GenerationId, GlobalModel, ItemFactor, LatentError, LatentResult, UserFactor,
};
use latent_index::HnswIndex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::generation::{Generation, NewGeneration};

const MANIFEST_MAGIC: &[u8; 4] = b"LMNF";
const MANIFEST_VERSION: u32 = 1;

const CURRENT_FILE: &str = "CURRENT";
const LOCK_FILE: &str = "LOCK";
const MODELS_DIR: &str = "models";
const MANIFEST_FILE: &str = "MANIFEST";

const USERS_VEC: &str = "users.vec";
const USERS_BIAS: &str = "users.bias";
const ITEMS_VEC: &str = "items.vec";
const ITEMS_BIAS: &str = "items.bias";
const INDEX_FILE: &str = "index.hnsw";

/// Metadata stored alongside the tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Directory sequence number
    pub sequence: u64,
    /// Generation id the model had when it was saved
    pub generation: GenerationId,
    /// Vector dimension
    pub dimension: usize,
    /// Global mean rating
    pub global_mean: f32,
    /// Batch completion time
    pub completion_time: Option<DateTime<Utc>>,
    /// Number of user rows
    pub user_count: usize,
    /// Number of item rows
    pub item_count: usize,
    /// CRC32 of every table file, by file name
    pub checksums: BTreeMap<String, u32>,
}

/// A model read back from disk
#[derive(Debug)]
pub struct LoadedArtifact {
    /// Manifest of the loaded directory
    pub manifest: ArtifactManifest,
    /// Rows, global model and index, ready to publish or restore
    pub model: NewGeneration,
    /// Rows that had a vector but no bias entry
    pub missing_biases: usize,
}

/// Directory of saved models with an atomic `CURRENT` pointer
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    retain: usize,
}

impl ArtifactStore {
    /// Open (creating if necessary) an artifact directory.
    ///
    /// Keeps the newest `retain` model directories after each save
    /// (at least one).
    pub fn open(root: impl AsRef<Path>, retain: usize) -> LatentResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(MODELS_DIR))?;
        Ok(Self {
            root,
            retain: retain.max(1),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, sequence: u64) -> PathBuf {
        self.root.join(MODELS_DIR).join(format!("{:020}", sequence))
    }

    /// Sequence numbers of all model directories, ascending
    fn sequences(&self) -> LatentResult<Vec<u64>> {
        let mut seqs = Vec::new();
        for entry in fs::read_dir(self.root.join(MODELS_DIR))? {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Sequence number `CURRENT` points to, if any
    pub fn current_sequence(&self) -> LatentResult<Option<u64>> {
        let raw = match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| LatentError::corruption(format!("CURRENT holds {:?}", raw.trim())))
    }

    /// Write `generation` as a new model directory and make it current
    pub fn save(&self, generation: &Generation) -> LatentResult<ArtifactManifest> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            LatentError::persistence(format!(
                "artifact directory '{}' is locked by another publisher",
                self.root.display()
            ))
        })?;

        let result = self.save_locked(generation);
        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!(target: "latent::artifact", error = %e, "Failed to release artifact lock");
        }
        result
    }

    fn save_locked(&self, generation: &Generation) -> LatentResult<ArtifactManifest> {
        // Generation ids on disk only move forward, so one id always names
        // one model. Saving the same generation again is allowed.
        if let Some(current) = self.current_manifest()? {
            let same = current.generation == generation.id()
                && current.completion_time == generation.global().completion_time;
            let newer_on_disk = current.generation > generation.id();
            if newer_on_disk || (current.generation == generation.id() && !same) {
                warn!(
                    target: "latent::artifact",
                    generation = generation.id().as_u64(),
                    saved = current.generation.as_u64(),
                    "Refusing to save over a newer or different model"
                );
                return Err(LatentError::PublishConflict {
                    expected: generation.id().as_u64(),
                    actual: current.generation.as_u64(),
                });
            }
        }

        let sequence = self.sequences()?.last().map_or(1, |s| s + 1);
        let dir = self.model_dir(sequence);
        fs::create_dir_all(&dir)?;

        let users = generation.user_rows();
        let items = generation.item_rows();

        let user_vectors: Vec<(&str, &[f32])> = users
            .iter()
            .map(|u| (u.id.as_str(), u.factor.vector.as_slice()))
            .collect();
        let user_biases: Vec<(&str, f32)> =
            users.iter().map(|u| (u.id.as_str(), u.factor.bias)).collect();
        let item_vectors: Vec<(&str, &[f32])> = items
            .iter()
            .map(|i| (i.id.as_str(), i.factor.vector.as_slice()))
            .collect();
        let item_biases: Vec<(&str, f32)> =
            items.iter().map(|i| (i.id.as_str(), i.factor.bias)).collect();

        let mut checksums = BTreeMap::new();
        write_table(&dir, USERS_VEC, &encode(&user_vectors)?, &mut checksums)?;
        write_table(&dir, USERS_BIAS, &encode(&user_biases)?, &mut checksums)?;
        write_table(&dir, ITEMS_VEC, &encode(&item_vectors)?, &mut checksums)?;
        write_table(&dir, ITEMS_BIAS, &encode(&item_biases)?, &mut checksums)?;
        write_table(&dir, INDEX_FILE, &generation.index().to_bytes()?, &mut checksums)?;

        let manifest = ArtifactManifest {
            sequence,
            generation: generation.id(),
            dimension: generation.dimension(),
            global_mean: generation.global().global_mean,
            completion_time: generation.global().completion_time,
            user_count: users.len(),
            item_count: items.len(),
            checksums,
        };
        write_manifest(&dir.join(MANIFEST_FILE), &manifest)?;
        File::open(&dir)?.sync_all()?;

        write_atomic(&self.root.join(CURRENT_FILE), format!("{}\n", sequence).as_bytes())?;

        info!(
            target: "latent::artifact",
            sequence,
            generation = generation.id().as_u64(),
            users = manifest.user_count,
            items = manifest.item_count,
            "Model artifact saved"
        );

        self.prune(sequence);
        Ok(manifest)
    }

    /// Remove old model directories beyond the retention count
    fn prune(&self, current: u64) {
        let seqs = match self.sequences() {
            Ok(seqs) => seqs,
            Err(e) => {
                warn!(target: "latent::artifact", error = %e, "Failed to list model directories");
                return;
            }
        };
        let excess = seqs.len().saturating_sub(self.retain);
        for seq in seqs.into_iter().take(excess).filter(|s| *s != current) {
            if let Err(e) = fs::remove_dir_all(self.model_dir(seq)) {
                warn!(target: "latent::artifact", sequence = seq, error = %e, "Failed to prune model");
            }
        }
    }

    /// Read only the manifest of the current model
    pub fn current_manifest(&self) -> LatentResult<Option<ArtifactManifest>> {
        match self.current_sequence()? {
            Some(seq) => load_manifest(&self.model_dir(seq).join(MANIFEST_FILE)).map(Some),
            None => Ok(None),
        }
    }

    /// Load the model `CURRENT` points to
    pub fn load_current(&self) -> LatentResult<Option<LoadedArtifact>> {
        match self.current_sequence()? {
            Some(seq) => self.load(seq).map(Some),
            None => Ok(None),
        }
    }

    /// Load a specific model directory
    pub fn load(&self, sequence: u64) -> LatentResult<LoadedArtifact> {
        let dir = self.model_dir(sequence);
        let manifest = load_manifest(&dir.join(MANIFEST_FILE))?;

        let user_vectors: Vec<(String, Vec<f32>)> =
            decode(&read_table(&dir, USERS_VEC, &manifest)?, USERS_VEC)?;
        let user_biases: HashMap<String, f32> =
            decode::<Vec<(String, f32)>>(&read_table(&dir, USERS_BIAS, &manifest)?, USERS_BIAS)?
                .into_iter()
                .collect();
        let item_vectors: Vec<(String, Vec<f32>)> =
            decode(&read_table(&dir, ITEMS_VEC, &manifest)?, ITEMS_VEC)?;
        let item_biases: HashMap<String, f32> =
            decode::<Vec<(String, f32)>>(&read_table(&dir, ITEMS_BIAS, &manifest)?, ITEMS_BIAS)?
                .into_iter()
                .collect();
        let index = HnswIndex::from_bytes(&read_table(&dir, INDEX_FILE, &manifest)?)?;

        let mut missing_biases = 0usize;
        let mut bias_for = |biases: &HashMap<String, f32>, id: &str| match biases.get(id) {
            Some(b) => *b,
            None => {
                missing_biases += 1;
                0.0
            }
        };

        let users: Vec<UserFactor> = user_vectors
            .into_iter()
            .map(|(id, vector)| {
                let bias = bias_for(&user_biases, &id);
                UserFactor {
                    id: id.into(),
                    factor: Factor::new(vector, bias),
                }
            })
            .collect();
        let items: Vec<ItemFactor> = item_vectors
            .into_iter()
            .map(|(id, vector)| {
                let bias = bias_for(&item_biases, &id);
                ItemFactor {
                    id: id.into(),
                    factor: Factor::new(vector, bias),
                }
            })
            .collect();

        if users.len() != manifest.user_count || items.len() != manifest.item_count {
            return Err(LatentError::corruption(format!(
                "model {} row counts disagree with manifest",
                sequence
            )));
        }
        if missing_biases > 0 {
            warn!(
                target: "latent::artifact",
                sequence,
                missing_biases,
                "Rows without a bias entry loaded with bias 0.0"
            );
        }

        let global = GlobalModel {
            global_mean: manifest.global_mean,
            completion_time: manifest.completion_time,
        };
        info!(
            target: "latent::artifact",
            sequence,
            generation = manifest.generation.as_u64(),
            users = users.len(),
            items = items.len(),
            "Model artifact loaded"
        );

        Ok(LoadedArtifact {
            manifest,
            model: NewGeneration {
                users,
                items,
                global,
                index: Arc::new(index),
            },
            missing_biases,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> LatentResult<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| LatentError::serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], name: &str) -> LatentResult<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| LatentError::corruption(format!("{}: decode failed: {}", name, e)))
}

fn write_table(
    dir: &Path,
    name: &str,
    bytes: &[u8],
    checksums: &mut BTreeMap<String, u32>,
) -> LatentResult<()> {
    let mut file = File::create(dir.join(name))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    checksums.insert(name.to_string(), crc32fast::hash(bytes));
    Ok(())
}

fn read_table(dir: &Path, name: &str, manifest: &ArtifactManifest) -> LatentResult<Vec<u8>> {
    let bytes = fs::read(dir.join(name))?;
    let expected = manifest
        .checksums
        .get(name)
        .ok_or_else(|| LatentError::corruption(format!("manifest has no checksum for {}", name)))?;
    let actual = crc32fast::hash(&bytes);
    if actual != *expected {
        return Err(LatentError::corruption(format!(
            "{}: checksum mismatch: expected {:08x}, got {:08x}",
            name, expected, actual
        )));
    }
    Ok(bytes)
}

/// Write `bytes` to `path` via temp + fsync + rename
fn write_atomic(path: &Path, bytes: &[u8]) -> LatentResult<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn write_manifest(path: &Path, manifest: &ArtifactManifest) -> LatentResult<()> {
    let payload = encode(manifest)?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(MANIFEST_MAGIC);
    buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload);
    write_atomic(path, &buf)
}

fn load_manifest(path: &Path) -> LatentResult<ArtifactManifest> {
    let buf = fs::read(path)?;
    if buf.len() < 8 {
        return Err(LatentError::corruption("manifest too small"));
    }
    if &buf[0..4] != MANIFEST_MAGIC {
        return Err(LatentError::corruption("bad manifest magic"));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != MANIFEST_VERSION {
        return Err(LatentError::corruption(format!(
            "unsupported manifest version {}",
            version
        )));
    }
    decode(&buf[8..], MANIFEST_FILE)
}
