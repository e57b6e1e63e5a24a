// src/index/vector_backend.rs
// Vector similarity backend used internally by the Index Store. Qdrant is
// the production implementation; tests use the in-memory brute-force one.

use async_trait::async_trait;

use crate::domain::RecordKind;
use crate::error::EngineResult;

#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert(&self, id: &str, kind: RecordKind, vector: &[f32]) -> EngineResult<()>;

    async fn delete(&self, id: &str) -> EngineResult<()>;

    async fn search(
        &self,
        kind_filter: Option<RecordKind>,
        query: &[f32],
        k: usize,
        min_score: f32,
    ) -> EngineResult<Vec<(String, f32)>>;

    async fn health_check(&self) -> EngineResult<()>;
}

pub mod qdrant_backend {
    use super::*;
    use qdrant_client::qdrant::{
        vectors_output::VectorsOptions, CreateCollectionBuilder, Condition, DeletePointsBuilder,
        Distance, Filter, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
        VectorParamsBuilder,
    };
    use qdrant_client::Qdrant;
    use std::collections::HashMap;
    use std::hash::{Hash, Hasher};
    use tracing::{info, warn};

    pub struct QdrantVectorBackend {
        client: Qdrant,
        collection: String,
    }

    fn point_id_for(id: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    impl QdrantVectorBackend {
        pub async fn new(url: &str, collection: &str, dimensions: u64) -> EngineResult<Self> {
            let client = Qdrant::from_url(url)
                .skip_compatibility_check()
                .build()
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;

            let exists = client
                .collection_exists(collection)
                .await
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;

            if !exists {
                match client
                    .create_collection(
                        CreateCollectionBuilder::new(collection)
                            .vectors_config(VectorParamsBuilder::new(dimensions, Distance::Cosine)),
                    )
                    .await
                {
                    Ok(_) => info!(collection, "created vector collection"),
                    Err(e) => warn!(collection, error = %e, "collection creation raced, continuing"),
                }
            }

            Ok(Self {
                client,
                collection: collection.to_string(),
            })
        }
    }

    #[async_trait]
    impl VectorBackend for QdrantVectorBackend {
        async fn upsert(&self, id: &str, kind: RecordKind, vector: &[f32]) -> EngineResult<()> {
            let mut payload = HashMap::new();
            payload.insert("id".to_string(), id.into());
            payload.insert("kind".to_string(), kind.as_str().into());

            let point = PointStruct::new(point_id_for(id), vector.to_vec(), payload);
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
                .await
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;
            Ok(())
        }

        async fn delete(&self, id: &str) -> EngineResult<()> {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&self.collection)
                        .points(vec![point_id_for(id)])
                        .wait(true),
                )
                .await
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;
            Ok(())
        }

        async fn search(
            &self,
            kind_filter: Option<RecordKind>,
            query: &[f32],
            k: usize,
            min_score: f32,
        ) -> EngineResult<Vec<(String, f32)>> {
            let mut builder = SearchPointsBuilder::new(&self.collection, query.to_vec(), k as u64)
                .with_payload(true)
                .score_threshold(min_score);

            if let Some(kind) = kind_filter {
                builder = builder.filter(Filter::must([Condition::matches(
                    "kind",
                    kind.as_str().to_string(),
                )]));
            }

            let response = self
                .client
                .search_points(builder)
                .await
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;

            let mut out = Vec::with_capacity(response.result.len());
            for point in response.result {
                let id = point
                    .payload
                    .get("id")
                    .and_then(|v| v.as_str().map(str::to_string));
                if let Some(id) = id {
                    out.push((id, point.score));
                }
            }
            Ok(out)
        }

        async fn health_check(&self) -> EngineResult<()> {
            self.client
                .collection_exists(&self.collection)
                .await
                .map_err(|e| crate::error::EngineError::transient(e.to_string()))?;
            Ok(())
        }
    }

    // Silences an unused-import warning when VectorsOptions isn't pattern
    // matched directly; kept for parity with the payload-decoding shape used
    // elsewhere in this backend.
    #[allow(dead_code)]
    fn _unused(_: Option<VectorsOptions>) {}
}

#[cfg(any(test, feature = "test-util"))]
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    pub struct InMemoryVectorBackend {
        points: Mutex<HashMap<String, (RecordKind, Vec<f32>)>>,
    }

    impl InMemoryVectorBackend {
        pub fn new() -> Self {
            Self {
                points: Mutex::new(HashMap::new()),
            }
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    #[async_trait]
    impl VectorBackend for InMemoryVectorBackend {
        async fn upsert(&self, id: &str, kind: RecordKind, vector: &[f32]) -> EngineResult<()> {
            self.points
                .lock()
                .await
                .insert(id.to_string(), (kind, vector.to_vec()));
            Ok(())
        }

        async fn delete(&self, id: &str) -> EngineResult<()> {
            self.points.lock().await.remove(id);
            Ok(())
        }

        async fn search(
            &self,
            kind_filter: Option<RecordKind>,
            query: &[f32],
            k: usize,
            min_score: f32,
        ) -> EngineResult<Vec<(String, f32)>> {
            let points = self.points.lock().await;
            let mut scored: Vec<(String, f32)> = points
                .iter()
                .filter(|(_, (kind, _))| kind_filter.map(|f| f == *kind).unwrap_or(true))
                .map(|(id, (_, v))| (id.clone(), cosine(query, v)))
                .filter(|(_, score)| *score >= min_score)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            Ok(scored)
        }

        async fn health_check(&self) -> EngineResult<()> {
            Ok(())
        }
    }
}
