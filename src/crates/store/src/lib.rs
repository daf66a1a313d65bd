#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

mod drv;
mod store_path;

use hashbrown::HashMap;

pub use drv::{Derivation, DerivationEnv, Output as DerivationOutput};
pub use store_path::StorePath;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("std io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("failed to parse recipe `{0}`: {1}")]
    Parse(StorePath, #[source] serde_json::Error),

    #[error("`{0}` is not a recipe path")]
    NotARecipe(StorePath),
}

/// Result of a finished (or cached) build: the realized output paths and
/// their total on-disk size.
#[derive(Debug, Default)]
pub struct BuildOutput {
    pub outputs: HashMap<String, StorePath>,
    pub size: u64,
}

/// Narrow gateway to the build store. The queue monitor only ever asks
/// whether a path is realized and reads recipes; everything else the store
/// can do belongs to the builder side.
pub trait Store: Send + Sync {
    /// Whether the path exists in the store (its contents are realized).
    fn is_valid_path(&self, path: &StorePath) -> bool;

    /// Read and parse the recipe stored at `path`.
    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, Error>;

    /// Collect the realized outputs of a recipe.
    fn build_output(&self, drv: &Derivation) -> Result<BuildOutput, Error> {
        let mut outputs = HashMap::with_capacity(drv.outputs.len());
        let mut size = 0;
        for o in &drv.outputs {
            size += self.path_size(&o.path);
            outputs.insert(o.name.clone(), o.path.clone());
        }
        Ok(BuildOutput { outputs, size })
    }

    /// On-disk size of a store path, 0 if unknown.
    fn path_size(&self, path: &StorePath) -> u64;
}

/// Store rooted at a local directory. Store paths are absolute paths below
/// the root; a path is valid iff it exists on disk.
pub struct LocalStore {
    root: std::path::PathBuf,
}

impl LocalStore {
    #[must_use]
    pub fn new(root: std::path::PathBuf) -> Self {
        Self { root }
    }

    fn to_fs_path(&self, path: &StorePath) -> std::path::PathBuf {
        let p = std::path::Path::new(path.as_str());
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

impl Store for LocalStore {
    fn is_valid_path(&self, path: &StorePath) -> bool {
        fs_err::metadata(self.to_fs_path(path)).is_ok()
    }

    #[tracing::instrument(skip(self), fields(%path), err)]
    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, Error> {
        if !path.is_drv() {
            return Err(Error::NotARecipe(path.clone()));
        }
        let input = fs_err::read_to_string(self.to_fs_path(path))?;
        drv::parse_drv(path, &input)
    }

    fn path_size(&self, path: &StorePath) -> u64 {
        fs_err::metadata(self.to_fs_path(path)).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_local_store_validity() {
        let dir = std::env::temp_dir().join(format!("store-utils-test-{}", std::process::id()));
        fs_err::create_dir_all(&dir).unwrap();
        let file = dir.join("abc-present");
        fs_err::write(&file, b"x").unwrap();

        let store = LocalStore::new(dir.clone());
        assert!(store.is_valid_path(&StorePath::new(file.to_str().unwrap())));
        assert!(!store.is_valid_path(&StorePath::new(dir.join("abc-missing").to_str().unwrap())));

        fs_err::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_local_store_read_derivation() {
        let dir = std::env::temp_dir().join(format!("store-utils-drv-test-{}", std::process::id()));
        fs_err::create_dir_all(&dir).unwrap();
        let file = dir.join("abc-hello.drv");
        fs_err::write(
            &file,
            br#"{"platform": "x86_64-linux", "outputs": {"out": "/tmp/abc-hello"}}"#,
        )
        .unwrap();

        let store = LocalStore::new(dir.clone());
        let drv = store
            .read_derivation(&StorePath::new(file.to_str().unwrap()))
            .unwrap();
        assert_eq!(drv.platform, "x86_64-linux");
        assert_eq!(drv.outputs.len(), 1);

        let err = store
            .read_derivation(&StorePath::new("/tmp/not-a-recipe"))
            .unwrap_err();
        assert!(matches!(err, Error::NotARecipe(_)));

        fs_err::remove_dir_all(&dir).unwrap();
    }
}
