//! Read access to the datasets, files and replicas a push job delivers.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tardis_model::{Dataset, DatasetId, FileId, FileRecord, PushTarget, Replica};
use tracing::debug;

use crate::PushError;

/// Source of dataset, file and replica records.
pub trait Catalog: Send + Sync {
    fn dataset(&self, id: DatasetId) -> Option<Dataset>;

    fn file(&self, id: FileId) -> Option<FileRecord>;

    /// Every file the target covers, or `None` if the target does not exist.
    fn files_for(&self, target: PushTarget) -> Option<Vec<FileRecord>>;

    fn replicas(&self, file: FileId) -> Vec<Replica>;
}

/// A catalog held in memory, loadable from a JSON export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCatalog {
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

impl MemoryCatalog {
    pub fn load(path: &Path) -> Result<Self, PushError> {
        let data = std::fs::read_to_string(path)?;
        let catalog: Self = serde_json::from_str(&data)?;
        debug!(
            datasets = catalog.datasets.len(),
            files = catalog.files.len(),
            replicas = catalog.replicas.len(),
            "loaded catalog from {:?}",
            path
        );
        Ok(catalog)
    }

    fn files_of(&self, dataset: DatasetId) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(move |f| f.dataset_id == dataset)
    }
}

impl Catalog for MemoryCatalog {
    fn dataset(&self, id: DatasetId) -> Option<Dataset> {
        self.datasets.iter().find(|d| d.id == id).cloned()
    }

    fn file(&self, id: FileId) -> Option<FileRecord> {
        self.files.iter().find(|f| f.id == id).cloned()
    }

    fn files_for(&self, target: PushTarget) -> Option<Vec<FileRecord>> {
        match target {
            PushTarget::Datafile(id) => self.file(id).map(|f| vec![f]),
            PushTarget::Dataset(id) => {
                self.dataset(id)?;
                Some(self.files_of(id).cloned().collect())
            }
            PushTarget::Experiment(id) => {
                let datasets: Vec<_> = self
                    .datasets
                    .iter()
                    .filter(|d| d.experiments.contains(&id))
                    .collect();
                if datasets.is_empty() {
                    return None;
                }
                Some(
                    datasets
                        .into_iter()
                        .flat_map(|d| self.files_of(d.id))
                        .cloned()
                        .collect(),
                )
            }
        }
    }

    fn replicas(&self, file: FileId) -> Vec<Replica> {
        self.replicas
            .iter()
            .filter(|r| r.file_id == file)
            .cloned()
            .collect()
    }
}
