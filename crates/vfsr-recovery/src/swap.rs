//! Marker-file directory swap.
//!
//! Recovery never replaces the live cache in place. It drops a single marker
//! file into the *old* cache root whose content is the relative path to the
//! freshly built cache directory; the next process start exchanges the
//! directories before the VFS opens. All-or-nothing behavior rests on POSIX
//! rename atomicity — any validation or rename failure leaves the old root
//! untouched (modulo the consumed marker) and logs a diagnostic.

use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};
use vfsr_error::{Result, VfsrError};

/// Marker file name, placed in the old cache root.
pub const REPLACEMENT_MARKER: &str = "storages-replacement-marker";

/// Backup directory name given to the displaced old cache root.
pub const BACKUP_DIR: &str = "caches-backup";

/// Outcome of the startup swap check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// No marker present; normal startup.
    NoMarker,
    /// Directories exchanged; the old root now lives in `backup`.
    Swapped { backup: PathBuf },
    /// Marker present but invalid; it was consumed and the old root kept.
    Rejected { reason: String },
}

/// Relative path from `base` to `target`, with `..` segments for the
/// non-shared prefix of `base`.
fn relative_path(base: &Path, target: &Path) -> Result<PathBuf> {
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let target_parts: Vec<Component<'_>> = target.components().collect();

    let mut shared = 0_usize;
    while shared < base_parts.len()
        && shared < target_parts.len()
        && base_parts[shared] == target_parts[shared]
    {
        shared += 1;
    }

    let mut out = PathBuf::new();
    for _ in shared..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[shared..] {
        out.push(part.as_os_str());
    }
    if out.as_os_str().is_empty() {
        return Err(VfsrError::Format(
            "replacement target equals the cache root".to_owned(),
        ));
    }
    Ok(out)
}

/// Write the swap marker into `old_root`, pointing at `new_dir`.
pub fn write_swap_marker(old_root: &Path, new_dir: &Path) -> Result<()> {
    let relative = relative_path(old_root, new_dir)?;
    let line = relative
        .to_str()
        .ok_or_else(|| VfsrError::Format("replacement path is not UTF-8".to_owned()))?;
    std::fs::write(old_root.join(REPLACEMENT_MARKER), format!("{line}\n"))?;
    info!(
        target: "vfsr::swap",
        old = %old_root.display(),
        new = %relative.display(),
        "wrote replacement marker"
    );
    Ok(())
}

/// Check `old_root` for a pending swap and apply it.
///
/// Called on process start, before the VFS opens its storages. Validation
/// failures consume the marker and return [`SwapOutcome::Rejected`]; only
/// hard I/O failures surface as errors.
pub fn apply_pending_swap(old_root: &Path) -> Result<SwapOutcome> {
    let marker = old_root.join(REPLACEMENT_MARKER);
    let contents = match std::fs::read_to_string(&marker) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SwapOutcome::NoMarker);
        }
        Err(err) => return Err(VfsrError::Io(err)),
    };
    // The marker is one-shot whatever happens next.
    std::fs::remove_file(&marker)?;

    let relative = PathBuf::from(contents.trim());
    let canonical_target = match validate_target(old_root, &relative) {
        Ok(canonical) => canonical,
        Err(reason) => {
            warn!(target: "vfsr::swap", %reason, "rejecting replacement marker");
            return Ok(SwapOutcome::Rejected { reason });
        }
    };
    let target_inside_root = !relative.starts_with("..");

    let parent = old_root
        .parent()
        .ok_or_else(|| VfsrError::Format("cache root has no parent directory".to_owned()))?;
    let backup = parent.join(BACKUP_DIR);
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }

    std::fs::rename(old_root, &backup)?;
    // A target inside the old root moved along with the rename; a sibling
    // target stayed put, and its canonical path still resolves.
    let swap_source = if target_inside_root {
        backup.join(&relative)
    } else {
        canonical_target
    };
    if let Err(err) = std::fs::rename(&swap_source, old_root) {
        warn!(
            target: "vfsr::swap",
            %err,
            "final rename failed; restoring the old cache root"
        );
        std::fs::rename(&backup, old_root)?;
        return Err(VfsrError::Io(err));
    }

    info!(
        target: "vfsr::swap",
        root = %old_root.display(),
        backup = %backup.display(),
        "cache directories exchanged"
    );
    Ok(SwapOutcome::Swapped { backup })
}

fn validate_target(old_root: &Path, relative: &Path) -> std::result::Result<PathBuf, String> {
    if relative.as_os_str().is_empty() {
        return Err("marker names an empty path".to_owned());
    }
    if relative.is_absolute() {
        return Err("marker must carry a relative path".to_owned());
    }

    let target = old_root.join(relative);
    let canonical = target
        .canonicalize()
        .map_err(|err| format!("replacement target unresolvable: {err}"))?;
    let parent = old_root
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .ok_or_else(|| "cache root has no resolvable parent".to_owned())?;
    if !canonical.starts_with(&parent) {
        return Err(format!(
            "replacement target {} escapes the cache parent {}",
            canonical.display(),
            parent.display()
        ));
    }
    if !canonical.is_dir() {
        return Err("replacement target is not a directory".to_owned());
    }
    if canonical.join(REPLACEMENT_MARKER).exists() {
        return Err("replacement target carries its own marker".to_owned());
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, contents: &str) {
        std::fs::write(path, contents).expect("write file");
    }

    #[test]
    fn no_marker_is_normal_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        std::fs::create_dir(&root).expect("mkdir");
        assert_eq!(apply_pending_swap(&root).expect("swap"), SwapOutcome::NoMarker);
    }

    #[test]
    fn swap_exchanges_nested_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        let fresh = root.join("recovered");
        std::fs::create_dir_all(&fresh).expect("mkdir");
        touch(&root.join("old-data"), "old");
        touch(&fresh.join("new-data"), "new");

        write_swap_marker(&root, &fresh).expect("marker");
        let outcome = apply_pending_swap(&root).expect("swap");
        let backup = dir.path().join(BACKUP_DIR);
        assert_eq!(
            outcome,
            SwapOutcome::Swapped {
                backup: backup.clone()
            }
        );

        assert!(root.join("new-data").is_file());
        assert!(!root.join("old-data").exists());
        assert!(backup.join("old-data").is_file());
        assert!(!root.join(REPLACEMENT_MARKER).exists());
    }

    #[test]
    fn swap_exchanges_sibling_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        let fresh = dir.path().join("caches-recovered");
        std::fs::create_dir(&root).expect("mkdir");
        std::fs::create_dir(&fresh).expect("mkdir");
        touch(&fresh.join("new-data"), "new");

        write_swap_marker(&root, &fresh).expect("marker");
        let outcome = apply_pending_swap(&root).expect("swap");
        assert!(matches!(outcome, SwapOutcome::Swapped { .. }));
        assert!(root.join("new-data").is_file());
    }

    #[test]
    fn stale_backup_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        let fresh = root.join("recovered");
        let stale = dir.path().join(BACKUP_DIR);
        std::fs::create_dir_all(&fresh).expect("mkdir");
        std::fs::create_dir(&stale).expect("mkdir stale backup");
        touch(&stale.join("leftover"), "x");

        write_swap_marker(&root, &fresh).expect("marker");
        apply_pending_swap(&root).expect("swap");
        assert!(!dir.path().join(BACKUP_DIR).join("leftover").exists());
    }

    #[test]
    fn marker_escaping_parent_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        std::fs::create_dir(&root).expect("mkdir");
        touch(&root.join(REPLACEMENT_MARKER), "../../../etc\n");

        let outcome = apply_pending_swap(&root).expect("swap");
        assert!(matches!(outcome, SwapOutcome::Rejected { .. }));
        assert!(root.is_dir());
        assert!(!root.join(REPLACEMENT_MARKER).exists());
    }

    #[test]
    fn recursive_marker_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        let fresh = root.join("recovered");
        std::fs::create_dir_all(&fresh).expect("mkdir");
        touch(&fresh.join(REPLACEMENT_MARKER), "whatever\n");

        write_swap_marker(&root, &fresh).expect("marker");
        let outcome = apply_pending_swap(&root).expect("swap");
        assert!(matches!(outcome, SwapOutcome::Rejected { .. }));
        assert!(root.join("recovered").is_dir());
    }

    #[test]
    fn missing_target_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("caches");
        std::fs::create_dir(&root).expect("mkdir");
        touch(&root.join(REPLACEMENT_MARKER), "never-built\n");

        let outcome = apply_pending_swap(&root).expect("swap");
        assert!(matches!(outcome, SwapOutcome::Rejected { .. }));
    }

    #[test]
    fn relative_path_handles_both_shapes() {
        let base = Path::new("/a/b/caches");
        assert_eq!(
            relative_path(base, Path::new("/a/b/caches/recovered")).expect("nested"),
            PathBuf::from("recovered")
        );
        assert_eq!(
            relative_path(base, Path::new("/a/b/caches-recovered")).expect("sibling"),
            PathBuf::from("../caches-recovered")
        );
        assert!(relative_path(base, base).is_err());
    }
}
