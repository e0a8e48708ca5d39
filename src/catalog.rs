use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use crate::semantic::{
    preprocess_content, BoutiqueHit, DressTypeHit, Embedding, HitPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    /// Mean rating on a 0-5 scale
    pub mean: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Boutique,
    DressType,
}

/// A boutique or a dress-type offering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: u64,
    pub kind: EntityKind,
    /// Owning boutique for dress types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boutique_id: Option<u64>,
    pub name: String,
    pub area: String,
    /// Free-text category label as entered by the boutique
    pub category: String,
    pub catalogue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub rating: RatingSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Unix millis
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<u64>,
    #[serde(default, skip_serializing)]
    pub embedding: Option<Embedding>,
}

impl CatalogEntity {
    /// Text the entity's embedding is computed from.
    pub fn embedding_text(&self) -> Option<String> {
        preprocess_content(&[&self.name, &self.category, &self.area, &self.catalogue])
    }

    /// Valid coordinates, if any.
    pub fn coordinates(&self) -> Option<GeoPoint> {
        self.location.filter(GeoPoint::is_valid)
    }

    /// Denormalized payload stored next to this entity's vectors.
    pub fn payload(&self) -> HitPayload {
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };

        match self.kind {
            EntityKind::Boutique => HitPayload::Boutique(BoutiqueHit {
                entity_id: self.id,
                name: non_empty(&self.name),
                area: non_empty(&self.area),
                category: non_empty(&self.category),
                image: self.image.clone(),
            }),
            EntityKind::DressType => HitPayload::DressType(DressTypeHit {
                entity_id: self.id,
                boutique_id: self.boutique_id.unwrap_or_default(),
                name: non_empty(&self.name),
                area: non_empty(&self.area),
                category: non_empty(&self.category),
                image: self.image.clone(),
            }),
        }
    }
}

/// Read access to catalogue entities; the only write is the embedding field.
pub trait CatalogStore: Send + Sync {
    fn list(&self) -> anyhow::Result<Vec<CatalogEntity>>;
    fn get(&self, id: u64) -> anyhow::Result<Option<CatalogEntity>>;
    /// Most recently created first.
    fn recent(&self, limit: usize) -> anyhow::Result<Vec<CatalogEntity>>;
    fn upsert(&self, entity: CatalogEntity) -> anyhow::Result<()>;
    fn set_embedding(&self, id: u64, embedding: Embedding, content_hash: u64)
        -> anyhow::Result<()>;
}

/// One CSV line. Flat so the `csv` crate can (de)serialize it directly.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogRow {
    id: u64,
    kind: EntityKind,
    boutique_id: Option<u64>,
    name: String,
    area: String,
    category: String,
    catalogue: String,
    lat: Option<f64>,
    lng: Option<f64>,
    rating_mean: f64,
    rating_count: u32,
    image: Option<String>,
    created_at: i64,
    content_hash: Option<u64>,
    embedding: Option<String>,
}

impl From<&CatalogEntity> for CatalogRow {
    fn from(entity: &CatalogEntity) -> Self {
        Self {
            id: entity.id,
            kind: entity.kind,
            boutique_id: entity.boutique_id,
            name: entity.name.clone(),
            area: entity.area.clone(),
            category: entity.category.clone(),
            catalogue: entity.catalogue.clone(),
            lat: entity.location.map(|l| l.lat),
            lng: entity.location.map(|l| l.lng),
            rating_mean: entity.rating.mean,
            rating_count: entity.rating.count,
            image: entity.image.clone(),
            created_at: entity.created_at,
            content_hash: entity.content_hash,
            embedding: entity.embedding.as_ref().map(Embedding::to_base64),
        }
    }
}

impl TryFrom<CatalogRow> for CatalogEntity {
    type Error = anyhow::Error;

    fn try_from(row: CatalogRow) -> Result<Self, Self::Error> {
        let embedding = match row.embedding.as_deref().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => Some(
                Embedding::from_base64(encoded)
                    .with_context(|| format!("bad embedding for entity {}", row.id))?,
            ),
            _ => None,
        };

        let location = match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            kind: row.kind,
            boutique_id: row.boutique_id,
            name: row.name,
            area: row.area,
            category: row.category,
            catalogue: row.catalogue,
            location,
            rating: RatingSummary {
                mean: row.rating_mean,
                count: row.rating_count,
            },
            image: row.image.filter(|i| !i.trim().is_empty()),
            created_at: row.created_at,
            content_hash: row.content_hash,
            embedding,
        })
    }
}

/// CSV-file catalogue, fully loaded in memory and rewritten on change.
#[derive(Debug, Clone, Default)]
pub struct CatalogCsv {
    list: Arc<RwLock<Vec<CatalogEntity>>>,
    path: PathBuf,
}

impl CatalogCsv {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        if let Err(err) = std::fs::metadata(&path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new catalogue at {}", path.display());
                    let store = Self {
                        list: Arc::new(RwLock::new(vec![])),
                        path,
                    };
                    store.save()?;
                    return Ok(store);
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(&path)?;

        let mut entities = vec![];
        for row in csv_reader.deserialize::<CatalogRow>() {
            entities.push(CatalogEntity::try_from(row?)?);
        }

        log::info!(
            "loaded {} catalogue entities in {:?}",
            entities.len(),
            now.elapsed()
        );

        Ok(Self {
            list: Arc::new(RwLock::new(entities)),
            path,
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let list = self
            .list
            .read()
            .map_err(|_| anyhow!("catalogue lock poisoned"))?;

        let temp_path = self.path.with_extension("csv.tmp");
        {
            let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
            if list.is_empty() {
                // keep the header so an empty catalogue is still a valid file
                csv_wrt.write_record([
                    "id", "kind", "boutique_id", "name", "area", "category", "catalogue",
                    "lat", "lng", "rating_mean", "rating_count", "image", "created_at",
                    "content_hash", "embedding",
                ])?;
            }
            for entity in list.iter() {
                csv_wrt.serialize(CatalogRow::from(entity))?;
            }
            csv_wrt.flush()?;
        }
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}

impl CatalogStore for CatalogCsv {
    fn list(&self) -> anyhow::Result<Vec<CatalogEntity>> {
        Ok(self
            .list
            .read()
            .map_err(|_| anyhow!("catalogue lock poisoned"))?
            .clone())
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<CatalogEntity>> {
        Ok(self
            .list
            .read()
            .map_err(|_| anyhow!("catalogue lock poisoned"))?
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    fn recent(&self, limit: usize) -> anyhow::Result<Vec<CatalogEntity>> {
        let mut entities = self.list()?;
        entities.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        entities.truncate(limit);
        Ok(entities)
    }

    fn upsert(&self, entity: CatalogEntity) -> anyhow::Result<()> {
        {
            let mut list = self
                .list
                .write()
                .map_err(|_| anyhow!("catalogue lock poisoned"))?;
            match list.iter_mut().find(|e| e.id == entity.id) {
                Some(existing) => *existing = entity,
                None => list.push(entity),
            }
        }
        self.save()
    }

    fn set_embedding(
        &self,
        id: u64,
        embedding: Embedding,
        content_hash: u64,
    ) -> anyhow::Result<()> {
        {
            let mut list = self
                .list
                .write()
                .map_err(|_| anyhow!("catalogue lock poisoned"))?;
            let entity = list
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| anyhow!("catalogue entity {id} not found"))?;
            entity.embedding = Some(embedding);
            entity.content_hash = Some(content_hash);
        }
        self.save()
    }
}
