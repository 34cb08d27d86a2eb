use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Normalize a destination path to a relative path inside the store.
/// `""`, `"."` and `"/"` all mean the store root. `..` components are
/// rejected so archive entries and source-configured paths cannot escape.
pub fn clean_destination(dest: &str) -> AppResult<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(dest).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                return Err(AppError::InvalidInput(format!(
                    "path {:?} must not contain '..'",
                    dest
                )))
            }
            Component::Prefix(_) => {
                return Err(AppError::InvalidInput(format!(
                    "path {:?} must be relative",
                    dest
                )))
            }
        }
    }
    Ok(cleaned)
}

/// A filesystem scoped to one BundleDeployment: `{base}/{name}/`.
///
/// All writes land beneath the root. Creating a store destroys whatever a
/// previous process left at that scope.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Wipes `{base}/{name}` and recreates it empty.
    pub fn create(base: &Path, name: &str) -> AppResult<Self> {
        let scope = clean_destination(name)?;
        if scope.components().count() != 1 {
            return Err(AppError::InvalidInput(format!(
                "store scope {:?} must be a single path segment",
                name
            )));
        }
        let root = base.join(scope);
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a destination inside the store.
    pub fn resolve(&self, dest: &str) -> AppResult<PathBuf> {
        Ok(self.root.join(clean_destination(dest)?))
    }

    /// Stream a tar archive into the store at `dest`.
    ///
    /// Only directory and regular-file entries are accepted. Tar entries are
    /// not guaranteed to arrive parent-first, so parents are created on
    /// demand for file entries.
    pub fn copy_tar_archive<R: Read>(&self, reader: R, dest: &str) -> AppResult<()> {
        let target = self.resolve(dest)?;
        fs::create_dir_all(&target)?;

        let mut archive = tar::Archive::new(reader);
        for entry in archive
            .entries()
            .map_err(|e| AppError::Archive(format!("reading archive: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| AppError::Archive(format!("reading archive entry: {}", e)))?;
            let raw_path = entry
                .path()
                .map_err(|e| AppError::Archive(format!("reading entry path: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let rel = clean_destination(&raw_path)?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let out = target.join(rel);

            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                fs::create_dir_all(&out)?;
            } else if entry_type.is_file() {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = fs::File::create(&out)?;
                std::io::copy(&mut entry, &mut file)?;
            } else {
                return Err(AppError::Archive(format!(
                    "unsupported tar entry type {:?} for {:?}",
                    entry_type, raw_path
                )));
            }
        }
        Ok(())
    }

    /// Recursive merge-copy of `src` into the store at `dest`.
    pub fn copy_dir(&self, src: &Path, dest: &str) -> AppResult<()> {
        let target = self.resolve(dest)?;
        copy_dir_recursive(src, &target)
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> AppResult<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let out = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &out)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &out)?;
        }
        // Anything else (sockets, symlinks) has no business in bundle content.
    }
    Ok(())
}

/// sha256 over a sorted walk of the tree: relative path, NUL, contents, NUL
/// per file. Stable across platforms and directory iteration order.
pub fn tree_digest(root: &Path) -> AppResult<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in files {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let bytes = fs::read(root.join(&rel))?;
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> AppResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if entry.file_type()?.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| AppError::Internal(format!("path outside walk root: {}", e)))?
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}
