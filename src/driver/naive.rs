use std::io::Read;
use std::path::Path;

use crate::archive::{self, ApplyBehavior, Change, ChangeKind};
use crate::cancel::CancelToken;
use crate::driver::Driver;
use crate::error::{IoResultExt, Result, ResultExt};

/// diff computation for layers without a reusable upper directory
///
/// the layer (and its parent) are materialised through the driver's own
/// `get`/`put` and compared tree against tree.

pub(crate) fn diff(driver: &dyn Driver, id: &str, parent: Option<&str>) -> Result<Vec<u8>> {
    let layer_root = driver.get(id, "").context("failed to mount layer for diff")?;
    let result = diff_mounted(driver, &layer_root, parent);
    driver.put(id)?;
    result
}

fn diff_mounted(driver: &dyn Driver, layer_root: &Path, parent: Option<&str>) -> Result<Vec<u8>> {
    match parent {
        None => archive::pack_diff(layer_root),
        Some(parent) => {
            let parent_root = driver
                .get(parent, "")
                .context("failed to mount parent for diff")?;
            let changes = archive::changes_dirs(&parent_root, layer_root);
            driver.put(parent)?;
            archive::export_changes(layer_root, &changes?)
        }
    }
}

pub(crate) fn changes(
    driver: &dyn Driver,
    id: &str,
    parent: Option<&str>,
) -> Result<Vec<Change>> {
    let layer_root = driver
        .get(id, "")
        .context("failed to mount layer for changes")?;
    let result = match parent {
        None => archive::changes_dirs(Path::new("/nonexistent-empty-base"), &layer_root),
        Some(parent) => {
            let parent_root = driver
                .get(parent, "")
                .context("failed to mount parent for changes")?;
            let changes = archive::changes_dirs(&parent_root, &layer_root);
            driver.put(parent)?;
            changes
        }
    };
    driver.put(id)?;
    result
}

pub(crate) fn diff_size(driver: &dyn Driver, id: &str, parent: Option<&str>) -> Result<u64> {
    let layer_root = driver
        .get(id, "")
        .context("failed to mount layer for diff size")?;
    let result = (|| {
        let changes = match parent {
            None => archive::changes_dirs(Path::new("/nonexistent-empty-base"), &layer_root)?,
            Some(parent) => {
                let parent_root = driver.get(parent, "")?;
                let changes = archive::changes_dirs(&parent_root, &layer_root);
                driver.put(parent)?;
                changes?
            }
        };
        let mut size = 0u64;
        for change in &changes {
            if change.kind == ChangeKind::Deleted {
                continue;
            }
            let rel = change.path.strip_prefix("/").unwrap_or(&change.path);
            let full = layer_root.join(rel);
            let meta = full.symlink_metadata().with_path(&full)?;
            if meta.is_file() {
                size += meta.len();
            }
        }
        Ok(size)
    })();
    driver.put(id)?;
    result
}

pub(crate) fn apply_diff(
    driver: &dyn Driver,
    id: &str,
    diff: &mut dyn Read,
    cancel: &CancelToken,
) -> Result<u64> {
    let layer_root = driver
        .get(id, "")
        .context("failed to mount layer for apply")?;
    let result = archive::apply(diff, &layer_root, ApplyBehavior::Delete, cancel);
    driver.put(id)?;
    result
}
