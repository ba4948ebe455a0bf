// Whole-file read/write with crash-safe replace: content goes to a sibling
// `.tmp` file first and is renamed over the target. A process-wide table of
// per-path mutexes serializes writers so readers see either the previous or
// the new body, never a torn one.

use crate::error::Result;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

static LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut table = LOCKS.lock().expect("lock table poisoned");
    table
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

pub struct AtomicFile {
    path: PathBuf,
}

impl AtomicFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        AtomicFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<String> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("file lock poisoned");
        Ok(fs::read_to_string(&self.path)?)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("file lock poisoned");
        Ok(fs::read(&self.path)?)
    }

    pub fn write(&self, content: &str) -> Result<()> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("file lock poisoned");
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Append one line. Used by the farm history; each line is self-contained
    /// so the append does not need the replace dance.
    pub fn append_line(&self, line: &str) -> Result<()> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("file lock poisoned");
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().expect("file lock poisoned");
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.file_name().unwrap_or_default());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let file = AtomicFile::new(dir.path().join("a.txt"));
        file.write("first").unwrap();
        file.write("second").unwrap();
        assert_eq!(file.read().unwrap(), "second");
        assert!(!dir.path().join("a.txt.tmp").exists());
    }

    #[test]
    fn creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let file = AtomicFile::new(dir.path().join("deep/nested/a.txt"));
        file.write("content").unwrap();
        assert_eq!(file.read().unwrap(), "content");
    }

    #[test]
    fn appends_lines() {
        let dir = TempDir::new().unwrap();
        let file = AtomicFile::new(dir.path().join("log"));
        file.append_line("one").unwrap();
        file.append_line("two").unwrap();
        assert_eq!(file.read().unwrap(), "one\ntwo\n");
    }

    #[test]
    fn concurrent_writers_never_tear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("race.txt");
        let mut handles = Vec::new();
        for i in 0..8 {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let body = format!("{}", i).repeat(2048);
                AtomicFile::new(&path).write(&body).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let body = AtomicFile::new(&path).read().unwrap();
        assert_eq!(body.len(), 2048);
        assert!(body.chars().all(|c| c == body.chars().next().unwrap()));
    }
}
