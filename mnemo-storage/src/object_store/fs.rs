//! Directory-backed storage. Object names map to relative paths; `/` in a
//! name creates subdirectories.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use mnemo_core::error::{Error, Result};

use super::{ObjectStream, StorageAccess};

const TEMP_SUFFIX: &str = ".tmp";

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::Io {
            message: format!("failed to create storage directory {:?}", root),
            source: e,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && !name.ends_with(TEMP_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: "object names must be relative paths without `..`".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) && !name.ends_with(TEMP_SUFFIX) {
                out.push(name);
            }
        }
        Ok(())
    }
}

impl StorageAccess for FsStorage {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect(&self.root, prefix, &mut names)?;
        Ok(names)
    }

    fn get(&self, name: &str) -> Result<ObjectStream> {
        let path = self.path_of(name)?;
        let file = File::open(&path).map_err(|e| Error::ObjectStore {
            object: name.to_string(),
            message: e.to_string(),
        })?;
        let len = file.metadata()?.len();
        Ok(ObjectStream {
            len,
            reader: Box::new(file),
        })
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        debug!(object = name, bytes = data.len(), "Object written");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
