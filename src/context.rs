use anyhow::{Context, Result};
use log::{info, warn};
use vidface_vision::EmbeddingExtractor;

use crate::config::Config;
use crate::index::FlatIndex;
use crate::reference::ReferenceDatabase;
use crate::storage;

/// The reference database and its search index, built together and read-only afterwards.
///
/// Shared between requests behind an `Arc`; a rebuild produces a new `ReferenceSet` rather
/// than mutating this one.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    database: ReferenceDatabase,
    index: FlatIndex,
}

impl ReferenceSet {
    pub fn new(database: ReferenceDatabase) -> Self {
        let index = FlatIndex::build(database.embeddings());
        Self { database, index }
    }

    pub fn database(&self) -> &ReferenceDatabase {
        &self.database
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    /// Extract the reference directory named in `cfg`.
    pub fn build(cfg: &Config, extractor: &mut dyn EmbeddingExtractor) -> Result<Self> {
        let database = ReferenceDatabase::build_from_dir(
            &cfg.reference_dir,
            extractor,
            cfg.face_selection,
            cfg.label_style,
        )?;
        Ok(Self::new(database))
    }

    /// Write the index and the label list.
    pub fn persist(&self, cfg: &Config) -> Result<()> {
        self.index
            .persist(&cfg.index_path)
            .context("saving face index")?;
        storage::write_blob(&cfg.labels_path, &self.database.labels().to_vec())
            .context("saving face labels")?;
        Ok(())
    }

    pub fn load(cfg: &Config) -> Result<Self> {
        let index = FlatIndex::load(&cfg.index_path)?;
        let labels: Vec<String> = storage::read_blob(&cfg.labels_path)?;
        let database = ReferenceDatabase::from_parts(labels, index.vectors().to_owned())
            .context("face index and labels disagree")?;
        Ok(Self { database, index })
    }

    /// Startup path: reuse persisted files when allowed, otherwise build and persist.
    pub fn prepare(cfg: &Config, extractor: &mut dyn EmbeddingExtractor) -> Result<Self> {
        if cfg.reuse_index && cfg.index_path.exists() && cfg.labels_path.exists() {
            match Self::load(cfg) {
                Ok(set) => {
                    info!(
                        "Loaded {} reference(s) from {}",
                        set.database.len(),
                        cfg.index_path.display()
                    );
                    return Ok(set);
                }
                Err(e) => warn!("Rebuilding references: {:#}", e),
            }
        }

        let set = Self::build(cfg, extractor)?;
        set.persist(cfg)?;
        info!(
            "Indexed {} reference(s), dimension {}, saved to {}",
            set.database.len(),
            set.database.dim(),
            cfg.index_path.display()
        );
        Ok(set)
    }
}
