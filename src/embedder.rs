//! Embedding interface and the bundled implementations.
//!
//! The store fixes its dimensionality from the embedder at init; changing
//! embedders over an existing index requires a reset.

use crate::error::{Error, Result};
use finalfusion::io::ReadEmbeddings;
use finalfusion::prelude::*;
use finalfusion::storage::Storage;
use ndarray::Array1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dims(&self) -> usize;

    fn model(&self) -> &str;
}

impl std::fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.model())
            .field("dims", &self.dims())
            .finish()
    }
}

/// Scale a vector to unit length so cosine similarity reduces to a dot
/// product. Zero vectors come back unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().filter_map(|token| {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect();
        (!cleaned.is_empty()).then_some(cleaned)
    })
}

fn hash_bucket(token: &str, dims: usize) -> (usize, f32) {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let bucket = (u64::from_le_bytes(bytes) % dims as u64) as usize;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    (bucket, sign)
}

/// Deterministic feature-hashing embedder. No model files, identical text
/// always maps to the identical vector; the offline default and the fixture
/// for every test that needs stable scores.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(crate::config::HASH_EMBEDDER_DIMS)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0f32; self.dims];
        let mut any = false;
        for token in tokenize(text) {
            let (bucket, sign) = hash_bucket(&token, self.dims);
            v[bucket] += sign;
            any = true;
        }
        if !any {
            return Err(Error::invalid_input("cannot embed empty text"));
        }
        Ok(l2_normalize(v))
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        "hash-v1"
    }
}

/// GloVe word vectors via finalfusion. Loads the binary `.fifu` file when
/// present, otherwise the text format (converted and cached as `.fifu` for
/// the next start). A chunk embeds as the normalized mean of its token
/// vectors.
pub struct GloveEmbedder {
    embeddings: Arc<Embeddings<VocabWrap, StorageWrap>>,
    dims: usize,
}

impl GloveEmbedder {
    pub fn load(models_dir: &Path) -> Result<Self> {
        let fifu_path = models_dir.join("glove.50d.fifu");
        let txt_path = models_dir.join("glove.6B.50d.txt");

        let embeddings = if fifu_path.exists() {
            debug!("Loading embeddings from {:?}", fifu_path);
            let f = File::open(&fifu_path)?;
            let mut reader = BufReader::new(f);
            Embeddings::read_embeddings(&mut reader)
                .map_err(|e| Error::parse(format!("failed to parse embeddings: {}", e)))?
        } else if txt_path.exists() {
            debug!("Loading text embeddings from {:?}", txt_path);
            use finalfusion::compat::text::ReadText;
            use finalfusion::io::WriteEmbeddings;
            let f = File::open(&txt_path)?;
            let mut reader = BufReader::new(f);
            let emb = Embeddings::read_text(&mut reader)
                .map_err(|e| Error::parse(format!("failed to parse text embeddings: {}", e)))?;
            let wrapped: Embeddings<VocabWrap, StorageWrap> = emb.into();
            // Cache the binary form for the next start
            match File::create(&fifu_path) {
                Ok(mut out) => {
                    if let Err(e) = wrapped.write_embeddings(&mut out) {
                        warn!("Could not cache binary embeddings: {}", e);
                    }
                }
                Err(e) => warn!("Could not create {:?}: {}", fifu_path, e),
            }
            wrapped
        } else {
            return Err(Error::not_found(format!(
                "no embedding model under {:?} (looked for glove.50d.fifu, glove.6B.50d.txt)",
                models_dir
            )));
        };

        let dims = embeddings.storage().shape().1;
        debug!("Loaded {} word vectors ({} dims)", embeddings.len(), dims);
        Ok(Self {
            embeddings: Arc::new(embeddings),
            dims,
        })
    }
}

impl Embedder for GloveEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut sum = Array1::<f32>::zeros(self.dims);
        let mut count = 0usize;
        let mut any_token = false;
        for token in tokenize(text) {
            any_token = true;
            if let Some(vector) = self.embeddings.embedding(&token) {
                sum += &vector.view();
                count += 1;
            }
        }
        if !any_token {
            return Err(Error::invalid_input("cannot embed empty text"));
        }
        if count == 0 {
            // Fully out-of-vocabulary text still needs a stable vector
            let mut v = sum.to_vec();
            let (bucket, sign) = hash_bucket(text.trim(), self.dims);
            v[bucket] = sign;
            return Ok(v);
        }
        sum /= count as f32;
        Ok(l2_normalize(sum.to_vec()))
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        "glove-50d"
    }
}

/// Name-keyed embedder table built at process start.
pub struct EmbedderRegistry {
    embedders: HashMap<String, Arc<dyn Embedder>>,
}

impl EmbedderRegistry {
    /// Register the always-available hash embedder plus GloVe when model
    /// files exist under `models_dir`.
    pub fn bootstrap(models_dir: &Path) -> Self {
        let mut registry = Self {
            embedders: HashMap::new(),
        };
        registry.register("hash", Arc::new(HashEmbedder::default()));
        match GloveEmbedder::load(models_dir) {
            Ok(glove) => registry.register("glove", Arc::new(glove)),
            Err(e) => debug!("GloVe embedder unavailable: {}", e),
        }
        registry
    }

    pub fn register(&mut self, name: &str, embedder: Arc<dyn Embedder>) {
        self.embedders.insert(name.to_string(), embedder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Embedder>> {
        self.embedders.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<_> = self.embedders.keys().cloned().collect();
            known.sort_unstable();
            Error::invalid_input(format!("unknown embedder '{}'", name)).with_detail("known", known)
        })
    }
}
