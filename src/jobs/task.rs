use serde::{Deserialize, Serialize};

use crate::{
    catalog::CatalogEntity,
    context::AppContext,
    errors::CoreError,
    semantic::{content_hash, EmbeddingTier, HitPayload, ImageSource, ScoredHit},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// embed an image and search the image collection with it
    ImageSearch {
        source: ImageSource,
        /// the input file is an upload owned by this job
        #[serde(default)]
        transient: bool,
    },

    /// recompute a catalogue entity's vectors after it changed
    RefreshEmbedding { entity_id: u64 },
}

impl Task {
    /// Upload this job must delete once it is finished.
    pub fn transient_file(&self) -> Option<&std::path::Path> {
        match self {
            Task::ImageSearch {
                source,
                transient: true,
            } => source.local_path(),
            _ => None,
        }
    }
}

/// One image search hit as shown to users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    pub id: u64,
    pub payload: HitPayload,
    pub score: f32,
    /// false when the payload lacks a name or an area
    pub displayable: bool,
}

impl From<ScoredHit> for ImageMatch {
    fn from(hit: ScoredHit) -> Self {
        Self {
            id: hit.id,
            displayable: hit.payload.is_displayable(),
            payload: hit.payload,
            score: hit.score,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutput {
    Matches(Vec<ImageMatch>),
    Refreshed(RefreshOutcome),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub entity_id: u64,
    /// false when the stored embedding was already current
    pub text_updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tier: Option<EmbeddingTier>,
}

impl Task {
    pub fn run(&self, ctx: &AppContext) -> Result<JobOutput, CoreError> {
        match self {
            Task::ImageSearch { source, .. } => {
                log::debug!("image search for {source}");
                let embedding = ctx.provider.embed_image(source)?;

                let search = &ctx.config.search;
                let hits = ctx.image_store.search(
                    embedding.vector(),
                    search.image_result_limit,
                    search.score_threshold,
                )?;

                log::info!(
                    "image search ({} tier) matched {} entities",
                    embedding.tier(),
                    hits.len()
                );

                Ok(JobOutput::Matches(
                    hits.into_iter().map(ImageMatch::from).collect(),
                ))
            }
            Task::RefreshEmbedding { entity_id } => {
                let entity = ctx
                    .catalog
                    .get(*entity_id)?
                    .ok_or(CoreError::EntityNotFound(*entity_id))?;
                refresh_entity(ctx, &entity).map(JobOutput::Refreshed)
            }
        }
    }
}

/// Bring an entity's vectors in line with its current descriptive fields.
///
/// The text vector is recomputed only when the embedded content changed. The
/// image vector is best-effort: a failure there is logged and does not fail
/// the refresh.
pub fn refresh_entity(ctx: &AppContext, entity: &CatalogEntity) -> Result<RefreshOutcome, CoreError> {
    let payload = entity.payload();

    let mut text_updated = false;
    match entity.embedding_text() {
        Some(text) => {
            let hash = content_hash(&text);
            match &entity.embedding {
                // unchanged content: only refresh the payload next to the stored vector
                Some(embedding) if entity.content_hash == Some(hash) => {
                    ctx.text_store.upsert(entity.id, embedding, &payload)?;
                }
                _ => {
                    let embedding = ctx.provider.embed_text(&text)?;
                    ctx.catalog.set_embedding(entity.id, embedding.clone(), hash)?;
                    ctx.text_store.upsert(entity.id, &embedding, &payload)?;
                    text_updated = true;
                }
            }
        }
        None => log::warn!("entity {} has no text to embed", entity.id),
    }

    let mut image_tier = None;
    if let Some(source) = entity.image.as_deref().and_then(|r| ctx.image_source(r)) {
        match ctx.provider.embed_image(&source) {
            Ok(embedding) => {
                ctx.image_store.upsert(entity.id, embedding.vector(), &payload)?;
                image_tier = Some(embedding.tier());
            }
            Err(err) => log::warn!("no image vector for entity {}: {err}", entity.id),
        }
    }

    Ok(RefreshOutcome {
        entity_id: entity.id,
        text_updated,
        image_tier,
    })
}
