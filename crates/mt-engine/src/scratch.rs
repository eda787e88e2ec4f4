//! Per-evaluation scratch storage.

use mt_types::InfrastructureError;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Directory names never copied into a scratch tree.
const SKIPPED_DIRS: &[&str] = &[".git", "target"];

/// A private working directory for one evaluation.
///
/// The directory and everything the build wrote into it is removed when the
/// value is dropped, on every exit path (normal return, `?`, timeout, panic
/// or cancelled task).
#[derive(Debug)]
pub struct ScratchSpace {
    dir: TempDir,
}

impl ScratchSpace {
    /// Create a fresh directory under `root`, or the system temp dir.
    pub fn acquire(root: Option<&Path>) -> Result<Self, InfrastructureError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("mt-tune-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root).map_err(|e| scratch_error(root, e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| InfrastructureError::ScratchUnavailable {
            message: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Copy the allocator sources into the scratch directory.
    pub fn populate_from(&self, source: &Path) -> Result<(), InfrastructureError> {
        if !source.is_dir() {
            return Err(InfrastructureError::SourceUnavailable {
                path: source.display().to_string(),
            });
        }
        copy_tree(source, self.path())
    }

    pub fn write_file(
        &self,
        relative: impl AsRef<Path>,
        contents: &str,
    ) -> Result<PathBuf, InfrastructureError> {
        let path = self.join(relative);
        fs::write(&path, contents).map_err(|e| scratch_error(&path, e))?;
        Ok(path)
    }
}

fn scratch_error(path: &Path, e: std::io::Error) -> InfrastructureError {
    InfrastructureError::ScratchUnavailable {
        message: format!("{}: {e}", path.display()),
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), InfrastructureError> {
    let entries = fs::read_dir(from).map_err(|e| scratch_error(from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| scratch_error(from, e))?;
        let file_type = entry.file_type().map_err(|e| scratch_error(&entry.path(), e))?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            if SKIPPED_DIRS.iter().any(|s| entry.file_name() == *s) {
                continue;
            }
            fs::create_dir_all(&target).map_err(|e| scratch_error(&target, e))?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| scratch_error(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_sources_and_cleans_up() {
        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("allocator.c"), "int x;").unwrap();
        fs::create_dir(source.path().join("traces")).unwrap();
        fs::write(source.path().join("traces/short1.rep"), "a 0 8").unwrap();
        fs::create_dir(source.path().join(".git")).unwrap();
        fs::write(source.path().join(".git/HEAD"), "ref").unwrap();

        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::acquire(Some(root.path())).unwrap();
        scratch.populate_from(source.path()).unwrap();
        let header = scratch.write_file("tune_params.h", "#define A 1\n").unwrap();

        assert!(scratch.join("allocator.c").is_file());
        assert!(scratch.join("traces/short1.rep").is_file());
        assert!(!scratch.join(".git").exists());
        assert!(header.is_file());

        let path = scratch.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn missing_source_is_reported() {
        let scratch = ScratchSpace::acquire(None).unwrap();
        let err = scratch
            .populate_from(Path::new("/nonexistent/mt-tune/allocator"))
            .unwrap_err();
        assert!(matches!(err, InfrastructureError::SourceUnavailable { .. }));
    }
}
