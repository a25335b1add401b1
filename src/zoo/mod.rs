//! The tool zoo: the process-wide catalog of every discovered tool, with
//! lexical and vector indexes behind one read-mostly lock.

mod descriptor;
mod embedding;
mod lexical;
mod vector;

pub use descriptor::{split_qualified, ToolDescriptor, QUALIFIED_NAME_DELIMITER};
pub use embedding::{provider_from_config, EmbeddingProvider, HttpEmbeddings};

pub(crate) use lexical::query_terms;

#[cfg(test)]
pub(crate) use embedding::testing::HashEmbedder;

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    blocking::offload,
    config::ToolZooConfig,
    error::{GatewayError, GatewayResult},
    telemetry::{EventBus, TraceContext, TraceEventKind},
};

use lexical::LexicalIndex;
use vector::VectorIndex;

const EMBEDDING_CACHE_CAPACITY: usize = 256;
const SNAPSHOT_FILE: &str = "tool_index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct ZooStats {
    pub total: usize,
    pub per_server: BTreeMap<String, usize>,
    pub embedded_count: usize,
}

#[derive(Default)]
struct ZooInner {
    descriptors: HashMap<String, ToolDescriptor>,
    lexical: LexicalIndex,
    vector: VectorIndex,
}

/// On-disk snapshot of the catalog, letting unchanged tools skip
/// re-embedding across restarts.
#[derive(Serialize, Deserialize)]
struct ZooSnapshot {
    descriptors: Vec<ToolDescriptor>,
}

pub struct ToolZoo {
    inner: RwLock<ZooInner>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    /// query text -> embedding, so repeated routing queries embed once.
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    /// qualified name -> (description, embedding) carried over from the
    /// previous process lifetime.
    carried: Mutex<HashMap<String, (String, Vec<f32>)>>,
    lexical_weight: f32,
    snapshot_path: Option<PathBuf>,
    events: Option<EventBus>,
    degradation_reported: AtomicBool,
}

impl ToolZoo {
    pub fn new(
        config: &ToolZooConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        events: Option<EventBus>,
    ) -> Self {
        let snapshot_path = config.persist_dir.as_ref().map(|dir| dir.join(SNAPSHOT_FILE));
        let zoo = Self {
            inner: RwLock::new(ZooInner::default()),
            embedder,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
            carried: Mutex::new(HashMap::new()),
            lexical_weight: config.lexical_weight.clamp(0.0, 1.0),
            snapshot_path,
            events,
            degradation_reported: AtomicBool::new(false),
        };
        zoo.load_snapshot();
        zoo
    }

    /// Zoo with no persistence and an injected embedder; test seam.
    pub fn in_memory(
        lexical_weight: f32,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            inner: RwLock::new(ZooInner::default()),
            embedder,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
            carried: Mutex::new(HashMap::new()),
            lexical_weight: lexical_weight.clamp(0.0, 1.0),
            snapshot_path: None,
            events: None,
            degradation_reported: AtomicBool::new(false),
        }
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Index a descriptor, computing its embedding when missing.
    /// Re-indexing the same qualified name replaces the prior record.
    pub async fn index(&self, mut descriptor: ToolDescriptor) -> GatewayResult<()> {
        if descriptor.embedding.is_none() {
            descriptor.embedding = self.resolve_embedding(&descriptor).await;
        }

        let mut inner = self.inner.write();
        inner.lexical.insert(
            &descriptor.qualified_name,
            [
                descriptor.local_name.as_str(),
                descriptor.description.as_str(),
            ]
            .into_iter()
            .chain(descriptor.tags.iter().map(String::as_str)),
        );
        match &descriptor.embedding {
            Some(embedding) => inner
                .vector
                .insert(&descriptor.qualified_name, embedding.clone()),
            None => inner.vector.remove(&descriptor.qualified_name),
        }
        inner
            .descriptors
            .insert(descriptor.qualified_name.clone(), descriptor);
        Ok(())
    }

    async fn resolve_embedding(&self, descriptor: &ToolDescriptor) -> Option<Vec<f32>> {
        // Reuse the embedding already indexed for an identical description.
        if let Some(existing) = self.get(&descriptor.qualified_name) {
            if existing.description == descriptor.description {
                if let Some(embedding) = existing.embedding {
                    return Some(embedding);
                }
            }
        }
        // Reuse the snapshot carried over from the previous run.
        {
            let mut carried = self.carried.lock();
            if let Some((description, embedding)) = carried.get(&descriptor.qualified_name) {
                if *description == descriptor.description {
                    debug!(
                        tool = %descriptor.qualified_name,
                        "reusing persisted embedding"
                    );
                    return Some(embedding.clone());
                }
                carried.remove(&descriptor.qualified_name);
            }
        }

        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&descriptor.embedding_text()).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                self.report_degradation(format!(
                    "embedding '{}' failed: {}",
                    descriptor.qualified_name, e
                ));
                None
            }
        }
    }

    pub fn remove(&self, qualified_name: &str) {
        let mut inner = self.inner.write();
        inner.descriptors.remove(qualified_name);
        inner.lexical.remove(qualified_name);
        inner.vector.remove(qualified_name);
    }

    /// Drop every tool owned by a server. Called when a server dies.
    pub fn remove_server(&self, server: &str) {
        let mut inner = self.inner.write();
        let owned: Vec<String> = inner
            .descriptors
            .values()
            .filter(|d| d.server == server)
            .map(|d| d.qualified_name.clone())
            .collect();
        for name in owned {
            inner.descriptors.remove(&name);
            inner.lexical.remove(&name);
            inner.vector.remove(&name);
        }
    }

    pub fn get(&self, qualified_name: &str) -> Option<ToolDescriptor> {
        self.inner.read().descriptors.get(qualified_name).cloned()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.inner.read().descriptors.contains_key(qualified_name)
    }

    /// All descriptors, ordered by qualified name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        let mut all: Vec<ToolDescriptor> = inner.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        all
    }

    pub fn stats(&self) -> ZooStats {
        let inner = self.inner.read();
        let mut per_server = BTreeMap::new();
        for descriptor in inner.descriptors.values() {
            *per_server.entry(descriptor.server.clone()).or_insert(0) += 1;
        }
        ZooStats {
            total: inner.descriptors.len(),
            per_server,
            embedded_count: inner.vector.len(),
        }
    }

    /// Search the catalog. Empty queries return nothing; results are
    /// filtered by `min_score`, ordered by score with ties broken by server
    /// then qualified name, and truncated to `top_k`.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: usize,
        min_score: f32,
    ) -> Vec<(ToolDescriptor, f32)> {
        let terms = query_terms(query);
        if terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let semantic = match mode {
            SearchMode::Lexical => None,
            SearchMode::Semantic | SearchMode::Hybrid => self.query_embedding(query).await,
        };

        let inner = self.inner.read();
        let lexical_scores = inner.lexical.scores(&terms);
        let semantic_scores = semantic.map(|q| inner.vector.scores(&q));

        let mut combined: HashMap<&str, f32> = HashMap::new();
        match (&semantic_scores, mode) {
            // Semantic requested and available: vector scores alone.
            (Some(sem), SearchMode::Semantic) => {
                for (name, score) in sem {
                    combined.insert(name.as_str(), *score);
                }
            }
            // Hybrid: weighted sum over the union of both score maps.
            (Some(sem), SearchMode::Hybrid) => {
                let alpha = self.lexical_weight;
                for (name, score) in &lexical_scores {
                    combined.insert(name.as_str(), alpha * score);
                }
                for (name, score) in sem {
                    *combined.entry(name.as_str()).or_insert(0.0) += (1.0 - alpha) * score;
                }
            }
            // Lexical mode, or degraded semantic/hybrid.
            _ => {
                for (name, score) in &lexical_scores {
                    combined.insert(name.as_str(), *score);
                }
            }
        }

        let mut results: Vec<(ToolDescriptor, f32)> = combined
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .filter_map(|(name, score)| {
                inner
                    .descriptors
                    .get(name)
                    .map(|d| (d.clone(), score.clamp(0.0, 1.0)))
            })
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.server.cmp(&b.0.server))
                .then_with(|| a.0.qualified_name.cmp(&b.0.qualified_name))
        });
        results.truncate(top_k);
        results
    }

    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        let Some(embedder) = self.embedder.as_ref() else {
            self.report_degradation("no embedding provider configured".to_string());
            return None;
        };
        if let Some(cached) = self.query_cache.lock().get(query) {
            return Some(cached.clone());
        }
        match embedder.embed(query).await {
            Ok(embedding) => {
                self.query_cache
                    .lock()
                    .put(query.to_string(), embedding.clone());
                Some(embedding)
            }
            Err(e) => {
                self.report_degradation(format!("query embedding failed: {}", e));
                None
            }
        }
    }

    fn report_degradation(&self, reason: String) {
        if self.degradation_reported.swap(true, Ordering::Relaxed) {
            return;
        }
        warn!("semantic search degraded to lexical-only: {}", reason);
        if let Some(events) = &self.events {
            events.emit(
                TraceContext::background()
                    .event(TraceEventKind::EmbeddingDegraded { reason }),
            );
        }
    }

    /// Persist the catalog snapshot (identity + embeddings).
    pub async fn persist(&self) -> GatewayResult<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };
        let snapshot = ZooSnapshot {
            descriptors: self.list(),
        };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| GatewayError::Persistence(format!("encode tool index: {}", e)))?;
        offload(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &json)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await
    }

    fn load_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("failed to read tool index {}: {}", path.display(), e);
                return;
            }
        };
        match serde_json::from_slice::<ZooSnapshot>(&raw) {
            Ok(snapshot) => {
                let mut carried = self.carried.lock();
                for descriptor in snapshot.descriptors {
                    if let Some(embedding) = descriptor.embedding {
                        carried.insert(
                            descriptor.qualified_name,
                            (descriptor.description, embedding),
                        );
                    }
                }
                info!(
                    "loaded {} persisted tool embeddings from {}",
                    carried.len(),
                    path.display()
                );
            }
            Err(e) => warn!("ignoring corrupt tool index {}: {}", path.display(), e),
        }
    }
}
