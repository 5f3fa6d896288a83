use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::archive::{self, Change};
use crate::driver::format_mount_label;
use crate::driver::mount::{mount_overlay, unmount};
use crate::error::{IoResultExt, Result, ResultExt};

/// write-capture view for a continuity mount
///
/// an `init/ + upper/ + work/ + merged/` quad: `init` receives the
/// container seed, `merged` is the user's mount view and `upper` captures
/// every write for diff export.
pub struct WriteCapturer {
    root: PathBuf,
    lower: Option<PathBuf>,
}

impl WriteCapturer {
    pub fn new(root: &Path, lower: Option<PathBuf>) -> Result<Self> {
        let init = root.join("init");
        fs::create_dir_all(&init)
            .with_path(&init)
            .context("unable to create init directory")?;
        for sub in ["upper", "work", "merged"] {
            let dir = root.join(sub);
            fs::create_dir(&dir)
                .with_path(&dir)
                .context("unable to create capture directory")?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            lower,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// run the caller's seed function against the init layer
    ///
    /// with a lower view the init directory is stacked over it through a
    /// short-lived overlay mount; otherwise the callback sees the init
    /// directory itself.
    pub fn init(
        &self,
        init_func: &(dyn Fn(&Path) -> Result<()> + Send + Sync),
        mount_label: &str,
    ) -> Result<()> {
        let init_dir = self.root.join("init");
        match &self.lower {
            None => init_func(&init_dir).context("failure calling initialize on write capture"),
            Some(lower) => {
                let opts = format!(
                    "lowerdir={},upperdir={},workdir={}",
                    lower.display(),
                    init_dir.display(),
                    self.root.join("work").display()
                );
                let mount_data = format_mount_label(&opts, mount_label);
                let merged = self.root.join("merged");

                mount_overlay(&merged, &mount_data).context("failed to mount init layer")?;
                let seeded = init_func(&merged);
                let unmounted = unmount(&merged);
                seeded.context("failure calling initialize on write capture")?;
                unmounted
            }
        }
    }

    /// mount the read-write view and return the merged path
    pub fn mount(&self, mount_label: &str) -> Result<PathBuf> {
        let init_dir = self.root.join("init");
        let lower = match &self.lower {
            Some(lower) => format!("{}:{}", lower.display(), init_dir.display()),
            None => init_dir.display().to_string(),
        };

        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.root.join("upper").display(),
            self.root.join("work").display()
        );
        let mount_data = format_mount_label(&opts, mount_label);
        let merged = self.root.join("merged");

        mount_overlay(&merged, &mount_data).context("failed to mount layer")?;
        Ok(merged)
    }

    pub fn unmount(&self) -> Result<()> {
        unmount(&self.root.join("merged"))
    }

    /// the captured writes as a wire-form tar
    pub fn diff(&self) -> Result<Vec<u8>> {
        let diff_path = self.root.join("upper");
        debug!(path = %diff_path.display(), "tar with options");
        archive::pack_diff(&diff_path)
    }

    pub fn size(&self) -> Result<u64> {
        archive::directory_size(&self.root.join("upper"))
    }

    pub fn changes(&self) -> Result<Vec<Change>> {
        let lowers: Vec<PathBuf> = self.lower.iter().cloned().collect();
        archive::overlay_changes(&lowers, &self.root.join("upper"))
    }

    /// remove the capture directory entirely
    pub fn destroy(&self) -> Result<()> {
        fs::remove_dir_all(&self.root).with_path(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ChangeKind;
    use tempfile::tempdir;

    #[test]
    fn test_new_creates_quad() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("capture");
        let wc = WriteCapturer::new(&root, None).unwrap();

        for sub in ["init", "upper", "work", "merged"] {
            assert!(root.join(sub).is_dir());
        }
        assert_eq!(wc.root(), root);
    }

    #[test]
    fn test_init_without_lower_runs_on_init_dir() {
        let dir = tempdir().unwrap();
        let wc = WriteCapturer::new(&dir.path().join("c"), None).unwrap();

        wc.init(
            &|path: &Path| {
                fs::write(path.join("resolv.conf"), b"nameserver 1.1.1.1\n").with_path(path)
            },
            "",
        )
        .unwrap();

        assert!(dir.path().join("c/init/resolv.conf").exists());
    }

    #[test]
    fn test_diff_and_size_read_upper() {
        let dir = tempdir().unwrap();
        let wc = WriteCapturer::new(&dir.path().join("c"), None).unwrap();
        fs::write(dir.path().join("c/upper/written"), b"captured data").unwrap();

        assert_eq!(wc.size().unwrap(), 13);

        let tar_bytes = wc.diff().unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["written"]);
    }

    #[test]
    fn test_changes_against_lower() {
        let dir = tempdir().unwrap();
        let lower = dir.path().join("lower");
        fs::create_dir(&lower).unwrap();
        fs::write(lower.join("existing"), b"old").unwrap();

        let wc = WriteCapturer::new(&dir.path().join("c"), Some(lower)).unwrap();
        fs::write(dir.path().join("c/upper/existing"), b"new").unwrap();
        fs::write(dir.path().join("c/upper/added"), b"x").unwrap();

        let changes = wc.changes().unwrap();
        assert!(changes
            .iter()
            .any(|c| c.path.as_os_str() == "/existing" && c.kind == ChangeKind::Modified));
        assert!(changes
            .iter()
            .any(|c| c.path.as_os_str() == "/added" && c.kind == ChangeKind::Added));
    }

    #[test]
    fn test_destroy_removes_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("c");
        let wc = WriteCapturer::new(&root, None).unwrap();
        wc.destroy().unwrap();
        assert!(!root.exists());
    }
}
