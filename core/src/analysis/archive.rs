//! Resource-archive access.
//!
//! The classifier consumes named entries from an [`ArchiveReader`]; the
//! container format (and any decryption) lives behind this trait. The
//! directory-backed implementation is what tests and tooling use.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A named entry yielded by an archive.
pub struct ArchiveEntry<'a> {
    pub name: String,
    pub is_regular_file: bool,
    pub reader: Box<dyn BufRead + 'a>,
}

/// Forward-only iteration over named byte-stream entries.
pub trait ArchiveReader {
    /// Returns the next entry, or `None` at end of archive.
    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>>;
}

/// An archive backed by a flat directory: each file is one entry, yielded
/// in name order.
pub struct DirArchive {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirArchive {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("could not open resource directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(DirArchive { files, next: 0 })
    }
}

impl ArchiveReader for DirArchive {
    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = File::open(path)
            .with_context(|| format!("could not open resource entry {}", path.display()))?;
        Ok(Some(ArchiveEntry {
            name,
            is_regular_file: true,
            reader: Box::new(BufReader::new(file)),
        }))
    }
}

/// An in-memory archive for tests.
pub struct MemArchive {
    entries: Vec<(String, Vec<u8>)>,
    next: usize,
}

impl MemArchive {
    pub fn new(entries: Vec<(&str, String)>) -> Self {
        MemArchive {
            entries: entries
                .into_iter()
                .map(|(n, body)| (n.to_string(), body.into_bytes()))
                .collect(),
            next: 0,
        }
    }
}

impl ArchiveReader for MemArchive {
    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>> {
        let Some((name, body)) = self.entries.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some(ArchiveEntry {
            name: name.clone(),
            is_regular_file: true,
            reader: Box::new(body.as_slice()),
        }))
    }
}
