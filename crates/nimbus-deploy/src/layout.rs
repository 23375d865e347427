//! On-disk layout of the data directory.
//!
//! ```text
//! data_dir/
//!   nimbus.redb
//!   staging/<label>-<random>/
//!   sites/<label>/current -> releases/<seq>
//!   sites/<label>/releases/<seq>/
//! ```
//!
//! Staging lives on the same filesystem as `sites/` so promoting a staged
//! tree is a rename. The `current` symlink is replaced by renaming a fresh
//! link over it, which readers observe atomically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use nimbus_core::SiteId;

pub const DB_FILE: &str = "nimbus.redb";
const STAGING_DIR: &str = "staging";
const SITES_DIR: &str = "sites";
const RELEASES_DIR: &str = "releases";
const CURRENT_LINK: &str = "current";

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Paths under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the top-level directories and sweep staging leftovers from a
    /// previous run.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.sites_dir())?;
        let staging = self.staging_dir();
        if staging.exists() {
            for entry in fs::read_dir(&staging)? {
                let path = entry?.path();
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove stale staging dir");
                }
            }
        }
        fs::create_dir_all(staging)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.root.join(SITES_DIR)
    }

    pub fn site(&self, id: &SiteId) -> SiteLayout {
        SiteLayout {
            root: self.sites_dir().join(id.as_str()),
        }
    }
}

/// Paths for one site.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn release_dir(&self, seq: u64) -> PathBuf {
        self.releases_dir().join(seq.to_string())
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    /// Sequence number `current` points at, if any.
    pub fn current_release(&self) -> io::Result<Option<u64>> {
        let target = match fs::read_link(self.current_link()) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok()))
    }

    /// Canonical directory of release `seq`, or `None` if it is gone.
    /// A caller holding the result keeps seeing that one release.
    pub fn release_root(&self, seq: u64) -> io::Result<Option<PathBuf>> {
        match fs::canonicalize(self.release_dir(seq)) {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically repoint `current` at release `seq`.
    pub fn point_current_at(&self, seq: u64) -> io::Result<()> {
        let staged_link = self.root.join(format!(".{CURRENT_LINK}-{seq}.tmp"));
        match fs::remove_file(&staged_link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let target = Path::new(RELEASES_DIR).join(seq.to_string());
        symlink_dir(&target, &staged_link)?;
        if let Err(e) = fs::rename(&staged_link, self.current_link()) {
            let _ = fs::remove_file(&staged_link);
            return Err(e);
        }
        debug!(site_root = %self.root.display(), seq, "current release repointed");
        Ok(())
    }

    /// Remove the `current` pointer entirely.
    pub fn clear_current(&self) -> io::Result<()> {
        match fs::remove_file(self.current_link()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Release sequence numbers on disk, oldest first.
    pub fn releases(&self) -> io::Result<Vec<u64>> {
        let mut seqs = Vec::new();
        let entries = match fs::read_dir(self.releases_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(seqs),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Delete all but the newest `keep` releases. The live release is never
    /// removed. Returns the pruned sequence numbers.
    pub fn prune(&self, keep: usize, live: u64) -> io::Result<Vec<u64>> {
        let releases = self.releases()?;
        let excess = releases.len().saturating_sub(keep);
        let mut pruned = Vec::new();
        for seq in releases.into_iter().take(excess) {
            if seq == live {
                continue;
            }
            fs::remove_dir_all(self.release_dir(seq))?;
            pruned.push(seq);
        }
        Ok(pruned)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn site_layout(dir: &Path) -> SiteLayout {
        let layout = DataLayout::new(dir);
        layout.prepare().unwrap();
        let site = layout.site(&SiteId::parse("blog").unwrap());
        fs::create_dir_all(site.releases_dir()).unwrap();
        site
    }

    fn release(site: &SiteLayout, seq: u64, body: &str) {
        let dir = site.release_dir(seq);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), body).unwrap();
    }

    #[test]
    fn pointer_swaps_between_releases() {
        let dir = tempfile::tempdir().unwrap();
        let site = site_layout(dir.path());
        assert_eq!(site.current_release().unwrap(), None);
        assert_eq!(site.release_root(1).unwrap(), None);

        release(&site, 1, "one");
        release(&site, 2, "two");
        site.point_current_at(1).unwrap();
        assert_eq!(site.current_release().unwrap(), Some(1));

        site.point_current_at(2).unwrap();
        assert_eq!(site.current_release().unwrap(), Some(2));
        let root = site.release_root(2).unwrap().unwrap();
        assert_eq!(fs::read_to_string(root.join("index.html")).unwrap(), "two");

        site.clear_current().unwrap();
        assert_eq!(site.current_release().unwrap(), None);
        site.clear_current().unwrap();
    }

    #[test]
    fn prune_keeps_newest_and_live() {
        let dir = tempfile::tempdir().unwrap();
        let site = site_layout(dir.path());
        for seq in 1..=5 {
            release(&site, seq, "x");
        }
        let pruned = site.prune(2, 5).unwrap();
        assert_eq!(pruned, vec![1, 2, 3]);
        assert_eq!(site.releases().unwrap(), vec![4, 5]);

        // A live release outside the newest window survives.
        for seq in 6..=7 {
            release(&site, seq, "x");
        }
        site.prune(2, 4).unwrap();
        assert_eq!(site.releases().unwrap(), vec![4, 6, 7]);
    }

    #[test]
    fn prepare_sweeps_stale_staging() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        fs::create_dir_all(layout.staging_dir().join("blog-abc123")).unwrap();
        layout.prepare().unwrap();
        assert_eq!(fs::read_dir(layout.staging_dir()).unwrap().count(), 0);
        assert!(layout.sites_dir().is_dir());
    }
}
