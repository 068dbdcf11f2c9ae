//! Scoped Filesystem Access
//!
//! A `Directory` roots all reads and writes at a working subdirectory and is
//! the durable medium for checkpoints, task logs, and sidecar files. Parent
//! directories are created on demand; checkpoint-grade writes are fsynced so
//! a killed job never observes a torn file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A filesystem scope rooted at a working subdirectory.
#[derive(Debug, Clone)]
pub struct Directory {
    cwd: PathBuf,
}

impl Directory {
    /// Creates a scope rooted at `cwd`. The directory itself is created lazily
    /// by the first write.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// Root path of this scope.
    pub fn path(&self) -> &Path {
        &self.cwd
    }

    /// Path of an entry relative to this scope.
    pub fn rel(&self, sub: impl AsRef<Path>) -> PathBuf {
        let sub = sub.as_ref();
        if sub == Path::new(".") {
            self.cwd.clone()
        } else {
            self.cwd.join(sub)
        }
    }

    /// Absolute path of an entry in this scope.
    pub fn abs(&self, sub: impl AsRef<Path>) -> io::Result<PathBuf> {
        std::path::absolute(self.rel(sub))
    }

    /// A child scope.
    pub fn subdir(&self, sub: impl AsRef<Path>) -> Directory {
        Directory::new(self.rel(sub))
    }

    /// Checks whether a file or directory exists.
    pub fn has(&self, sub: impl AsRef<Path>) -> bool {
        self.rel(sub).exists()
    }

    /// Creates a directory recursively.
    pub fn mkdir(&self, sub: impl AsRef<Path>) -> io::Result<()> {
        fs::create_dir_all(self.rel(sub))
    }

    /// Removes a file or a directory tree. Missing entries are not an error.
    pub fn remove(&self, sub: impl AsRef<Path>) -> io::Result<()> {
        let path = self.rel(sub);
        let result = match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Copies a file or a directory tree within this scope.
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<()> {
        let src = self.rel(src);
        let dst = self.rel(dst);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_recursive(&src, &dst)
    }

    /// Creates a symbolic link at `dst` pointing to `src`.
    #[cfg(unix)]
    pub fn link(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> io::Result<()> {
        let target = self.abs(src)?;
        let dst = self.rel(dst);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, dst)
    }

    /// Entry names in a directory, sorted.
    pub fn ls(&self, sub: impl AsRef<Path>) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.rel(sub))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Reads a text file.
    pub fn read(&self, sub: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.rel(sub))
    }

    /// Writes a text file, creating parents, and waits for the write to reach
    /// disk.
    pub fn write(&self, sub: impl AsRef<Path>, text: &str) -> io::Result<()> {
        let path = self.rel(sub);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()
    }

    /// Appends text to a file, creating it (and parents) if needed.
    pub fn append(&self, sub: impl AsRef<Path>, text: &str) -> io::Result<()> {
        let mut file = self.open_append(sub)?;
        file.write_all(text.as_bytes())?;
        file.flush()
    }

    /// Opens a file in append mode, creating it (and parents) if needed.
    /// Used to capture subprocess output.
    pub fn open_append(&self, sub: impl AsRef<Path>) -> io::Result<File> {
        let path = self.rel(sub);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Serializes a value to pretty-printed JSON and fsyncs the file.
    pub fn write_json<T: Serialize>(&self, sub: impl AsRef<Path>, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write(sub, &json)
    }

    /// Deserializes a value from a JSON file.
    pub fn load_json<T: DeserializeOwned>(&self, sub: impl AsRef<Path>) -> io::Result<T> {
        let text = self.read(sub)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Deserializes a value from a YAML file.
    pub fn load_yaml<T: DeserializeOwned>(&self, sub: impl AsRef<Path>) -> io::Result<T> {
        let text = self.read(sub)?;
        serde_yaml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Copies `src` to `dst`, recursing into directories.
fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}
