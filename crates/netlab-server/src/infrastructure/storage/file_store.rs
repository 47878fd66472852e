//! Directory-backed [`FileRepository`].
//!
//! All files live directly inside one root directory (`server_files` by
//! default).  Names are reduced to their final path component before use, so
//! `../../etc/passwd` can only ever mean `<root>/passwd`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use netlab_core::protocol::command::base_name;
use tracing::debug;

use crate::application::file_repository::{FileReader, FileRepository, FileWriter, StoreError};

/// Flat file store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if necessary) the store at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Root`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Root {
            path: root.clone(),
            source,
        })?;
        debug!(root = %root.display(), "file store ready");
        Ok(Self { root })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for a client-supplied name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidName`] if nothing usable remains after
    /// stripping directories.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let base = base_name(name).map_err(|_| StoreError::InvalidName(name.to_string()))?;
        Ok(self.root.join(base))
    }

    fn io_error(name: &str) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            name: name.to_string(),
            source,
        }
    }
}

impl FileRepository for FileStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        let root_error = |source: io::Error| StoreError::Root {
            path: self.root.clone(),
            source,
        };
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(root_error)? {
            let entry = entry.map_err(root_error)?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let path = self.path_for(name)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(name)(e)),
        }
    }

    fn writer(&self, name: &str, resume: bool) -> Result<FileWriter, StoreError> {
        let path = self.path_for(name)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume)
            .truncate(!resume)
            .open(&path)
            .map_err(Self::io_error(name))?;
        Ok(Box::new(file))
    }

    fn reader(&self, name: &str, offset: u64) -> Result<FileReader, StoreError> {
        let path = self.path_for(name)?;
        let mut file = File::open(&path).map_err(Self::io_error(name))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(Self::io_error(name))?;
        Ok(Box::new(file))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
