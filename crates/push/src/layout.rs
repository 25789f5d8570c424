//! Remote directory layout of pushed data.
//!
//! `<base>/mytardis-<job id>/<dataset name>/<file directory>/<filename>`

use tardis_model::{Dataset, FileRecord, JobId};
use tardis_transfer::validate_relative_path;

use crate::PushError;

/// Root directory of one job on the remote host.
pub fn job_dir(base: &str, job: JobId) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("mytardis-{job}")
    } else {
        format!("{base}/mytardis-{job}")
    }
}

/// Filesystem-safe rendering of a dataset: its description with runs of
/// whitespace collapsed to `_`, other unsafe characters dropped, then `_<id>`.
pub fn dataset_dir(dataset: &Dataset) -> String {
    let mut name = String::with_capacity(dataset.description.len());
    for word in dataset.description.split_whitespace() {
        let word: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        if word.is_empty() {
            continue;
        }
        if !name.is_empty() {
            name.push('_');
        }
        name.push_str(&word);
    }
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        format!("dataset_{}", dataset.id)
    } else {
        format!("{name}_{}", dataset.id)
    }
}

/// Full remote path of `file` within `job_dir`.
///
/// Fails if the file's recorded directory or name would leave its
/// dataset directory.
pub fn file_path(job_dir: &str, dataset: &Dataset, file: &FileRecord) -> Result<String, PushError> {
    let relative = file.relative_path();
    validate_relative_path(&relative)
        .map_err(|e| PushError::File(format!("unsafe remote path for file {}: {e}", file.id)))?;
    Ok(format!("{job_dir}/{}/{relative}", dataset_dir(dataset)))
}

/// Directory part of a remote path.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir).filter(|d| !d.is_empty())
}
