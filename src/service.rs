use std::{collections::HashMap, sync::Arc};

use serde::Serialize;

use crate::{
    activity::{ActionKind, Logged},
    catalog::{CatalogEntity, GeoPoint},
    context::AppContext,
    distance::DistanceError,
    eid::{Eid, InvalidEid},
    errors::CoreError,
    jobs::{refresh_entity, JobQueue, JobRunner, JobState, JobView, RefreshOutcome, Task},
    ranking::{
        fallback_results, parse_query, popularity_counts, rank_categories, rank_hits,
        rank_nearby, CategoryRanking, RankedEntity, SearchResponse,
    },
    semantic::{ImageSource, ScoredHit, TierCounts},
    storage::StorageManager,
};

/// User id recorded on jobs the system enqueues on its own.
const SYSTEM_USER: &str = "system";

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub image_tiers: TierCounts,
    pub jobs: JobCounts,
    pub catalog_entities: usize,
    pub activity_records: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub total: usize,
    pub text_updated: usize,
    pub failed: usize,
}

/// The operations the HTTP handlers and the CLI call into.
pub struct RecommendationService {
    ctx: AppContext,
    runner: JobRunner,
}

impl RecommendationService {
    /// Open the durable job queue and start the worker pool.
    pub fn new(ctx: AppContext) -> anyhow::Result<Self> {
        let queue = Arc::new(JobQueue::open(ctx.storage.clone(), &ctx.config.jobs)?);
        let runner = JobRunner::start(ctx.clone(), queue);

        Ok(Self { ctx, runner })
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Semantic search over the catalogue with rating/area post-filters.
    ///
    /// An empty outcome is replaced by a small sample of the newest entities
    /// and flagged with `used_fallback`.
    pub fn text_search(&self, user_id: &str, raw_query: &str) -> Result<SearchResponse, CoreError> {
        let raw_query = raw_query.trim();
        if raw_query.is_empty() {
            return Err(CoreError::MalformedInput("search query is empty".into()));
        }

        let parsed = parse_query(raw_query);
        if parsed.has_filters() {
            log::debug!("search filters: {parsed:?}");
        }
        let search = &self.ctx.config.search;
        let weights = &self.ctx.config.ranking.search;

        let (mut results, query_vector) = if parsed.query.is_empty() {
            // only filters were given: nothing to embed
            let candidates = self
                .ctx
                .catalog
                .list()?
                .into_iter()
                .map(|entity| (entity, 0.0))
                .collect();
            (
                rank_hits(candidates, &parsed, weights, search.result_limit),
                None,
            )
        } else {
            let embedding = self.ctx.provider.embed_text(&parsed.query)?;
            let hits = self.ctx.text_store.search(
                &embedding,
                search.candidate_limit,
                search.score_threshold,
            )?;
            let hydrated = self.hydrate(hits)?;
            (
                rank_hits(hydrated, &parsed, weights, search.result_limit),
                Some(embedding),
            )
        };

        if let Logged::Skipped(reason) =
            self.ctx
                .ledger
                .record(user_id, ActionKind::Search, raw_query, query_vector)
        {
            log::debug!("search not logged: {reason:?}");
        }

        let used_fallback = results.is_empty();
        if used_fallback {
            log::info!("no results for '{raw_query}', serving fallback sample");
            results = fallback_results(self.ctx.catalog.recent(search.fallback_sample_size)?);
        }

        Ok(SearchResponse {
            results,
            used_fallback,
            parsed,
        })
    }

    /// Pair vector hits with their catalogue entities; hits whose entity is
    /// gone are stale and dropped.
    fn hydrate(&self, hits: Vec<ScoredHit>) -> Result<Vec<(CatalogEntity, f32)>, CoreError> {
        if hits.is_empty() {
            return Ok(vec![]);
        }

        let mut by_id: HashMap<u64, CatalogEntity> = self
            .ctx
            .catalog
            .list()?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let entity = by_id.remove(&hit.payload.entity_id());
                if entity.is_none() {
                    log::debug!("dropping stale vector hit {}", hit.id);
                }
                entity.map(|e| (e, hit.score))
            })
            .collect())
    }

    /// Save an uploaded image under the transient uploads directory.
    pub fn save_upload(&self, bytes: &[u8]) -> Result<ImageSource, CoreError> {
        let format = image::guess_format(bytes)
            .map_err(|_| CoreError::MalformedInput("upload is not a supported image".into()))?;
        let ext = format.extensions_str().first().copied().unwrap_or("img");

        let ident = format!("{}.{ext}", Eid::new());
        self.ctx
            .uploads
            .write(&ident, bytes)
            .map_err(anyhow::Error::from)?;

        Ok(ImageSource::Path(self.ctx.uploads.path_of(&ident)))
    }

    /// Queue an image similarity search. `transient` marks the input file as
    /// owned by the job, to be deleted once it finishes.
    pub fn enqueue_image_search(
        &self,
        user_id: &str,
        source: ImageSource,
        transient: bool,
    ) -> Result<Eid, CoreError> {
        // only files under the uploads directory are ever deleted
        let drop_upload = |source: &ImageSource| {
            if let (true, Some(path)) = (transient, source.local_path()) {
                if self.ctx.uploads.contains(path) {
                    let _ = std::fs::remove_file(path);
                }
            }
        };

        if user_id.trim().is_empty() {
            drop_upload(&source);
            return Err(CoreError::MalformedInput("user id is required".into()));
        }
        if let (true, Some(path)) = (transient, source.local_path()) {
            if !self.ctx.uploads.contains(path) {
                return Err(CoreError::MalformedInput(format!(
                    "{} is not an upload",
                    path.display()
                )));
            }
        }
        if let Some(path) = source.local_path() {
            if !path.is_file() {
                return Err(CoreError::MalformedInput(format!(
                    "image {} does not exist",
                    path.display()
                )));
            }
        }

        let task = Task::ImageSearch {
            source: source.clone(),
            transient,
        };
        match self.enqueue(user_id.trim(), task) {
            Ok(id) => Ok(id),
            Err(err) => {
                drop_upload(&source);
                Err(err)
            }
        }
    }

    /// Queue an embedding refresh for a catalogue entity that changed.
    pub fn notify_entity_changed(&self, entity_id: u64) -> Result<Eid, CoreError> {
        if self.ctx.catalog.get(entity_id)?.is_none() {
            return Err(CoreError::EntityNotFound(entity_id));
        }
        self.enqueue(SYSTEM_USER, Task::RefreshEmbedding { entity_id })
    }

    fn enqueue(&self, user_id: &str, task: Task) -> Result<Eid, CoreError> {
        let job = self.runner.queue().push(user_id, task)?;
        self.runner.submit(job.id.clone())?;
        log::info!("queued job {}", job.id);
        Ok(job.id)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobView, CoreError> {
        let id: Eid = job_id
            .parse()
            .map_err(|e: InvalidEid| CoreError::MalformedInput(e.to_string()))?;

        self.runner
            .queue()
            .get(&id)
            .map(JobView::from)
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self) -> Vec<JobView> {
        self.runner
            .queue()
            .list()
            .into_iter()
            .map(JobView::from)
            .collect()
    }

    /// Catalogue entities around `origin`, scored by rating and proximity.
    fn rank_around(&self, origin: GeoPoint) -> Result<Vec<RankedEntity>, CoreError> {
        if !origin.is_valid() {
            return Err(CoreError::MalformedInput(format!(
                "invalid coordinates {},{}",
                origin.lat, origin.lng
            )));
        }

        let candidates: Vec<CatalogEntity> = self
            .ctx
            .catalog
            .list()?
            .into_iter()
            .filter(|e| e.coordinates().is_some())
            .collect();
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let destinations: Vec<GeoPoint> =
            candidates.iter().filter_map(CatalogEntity::coordinates).collect();
        let distances = self.ctx.distance.distances(origin, &destinations)?;
        if distances.len() != destinations.len() {
            return Err(DistanceError::Malformed(format!(
                "asked for {} distances, got {}",
                destinations.len(),
                distances.len()
            ))
            .into());
        }

        Ok(rank_nearby(
            candidates,
            &distances,
            &self.ctx.config.ranking.nearby,
        ))
    }

    /// Top entities near the user; the best few are logged as views.
    pub fn recommended_near(
        &self,
        user_id: &str,
        origin: GeoPoint,
    ) -> Result<Vec<RankedEntity>, CoreError> {
        let ranked = self.rank_around(origin)?;

        let top_k = self.ctx.config.ranking.nearby.view_log_top_k;
        for ranked_entity in ranked.iter().take(top_k) {
            let entity = &ranked_entity.entity;
            let content = entity.embedding_text().unwrap_or_else(|| entity.name.clone());
            let logged = self.ctx.ledger.record(
                user_id,
                ActionKind::View,
                &content,
                entity.embedding.clone(),
            );
            if let Logged::Skipped(reason) = logged {
                log::debug!("view of {} not logged: {reason:?}", entity.id);
            }
        }

        Ok(ranked)
    }

    /// Canonical categories for the user, personalized by recent views when
    /// there are any and ordered by local popularity otherwise.
    pub fn recommended_categories(
        &self,
        user_id: &str,
        origin: GeoPoint,
    ) -> Result<CategoryRanking, CoreError> {
        let window = self.ctx.ledger.recent_embeddings(
            user_id,
            ActionKind::View,
            self.ctx.config.ranking.personalization_window,
        );

        let ranked = self.rank_around(origin)?;
        let canonical = self.ctx.taxonomy.labels();

        let labels: Vec<String> = ranked
            .iter()
            .filter(|r| !r.entity.category.trim().is_empty())
            .filter_map(|r| self.canonical_label(&r.entity.category, &canonical))
            .collect();

        let mut popular = popularity_counts(labels);
        if popular.is_empty() {
            popular = canonical.into_iter().map(|label| (label, 0)).collect();
        }

        let ranking = rank_categories(popular, &window, &self.ctx.taxonomy, |labels| {
            self.ctx.provider.embed_texts(labels)
        })?;

        log::debug!(
            "ranked {} categories for {user_id} ({:?})",
            ranking.categories.len(),
            ranking.strategy
        );

        Ok(ranking)
    }

    /// Resolve a free-text category; with the provider down, only labels that
    /// already are canonical survive.
    fn canonical_label(&self, raw: &str, canonical: &[String]) -> Option<String> {
        match self.ctx.resolver.resolve(raw, canonical) {
            Ok(label) => Some(label),
            Err(err) => {
                log::warn!("could not resolve category '{raw}': {err}");
                canonical
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(raw.trim()))
                    .cloned()
            }
        }
    }

    /// Refresh every catalogue entity synchronously.
    pub fn reindex<F>(&self, mut on_entity: F) -> anyhow::Result<ReindexReport>
    where
        F: FnMut(&CatalogEntity, &Result<RefreshOutcome, CoreError>),
    {
        let entities = self.ctx.catalog.list()?;
        let mut report = ReindexReport {
            total: entities.len(),
            ..Default::default()
        };

        for entity in &entities {
            let outcome = refresh_entity(&self.ctx, entity);
            match &outcome {
                Ok(outcome) if outcome.text_updated => report.text_updated += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failed += 1;
                    log::warn!("failed to index entity {}: {err}", entity.id);
                }
            }
            on_entity(entity, &outcome);
        }

        Ok(report)
    }

    pub fn stats(&self) -> Result<Stats, CoreError> {
        let mut jobs = JobCounts::default();
        for job in self.runner.queue().list() {
            match job.state {
                JobState::Queued => jobs.queued += 1,
                JobState::Active => jobs.active += 1,
                JobState::Completed(_) => jobs.completed += 1,
                JobState::Failed(_) => jobs.failed += 1,
            }
        }

        Ok(Stats {
            image_tiers: self.ctx.provider.tier_counts(),
            jobs,
            catalog_entities: self.ctx.catalog.list()?.len(),
            activity_records: self.ctx.ledger.len(),
        })
    }

    /// Stop accepting jobs and wait for the workers to finish the ones they hold.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }
}
