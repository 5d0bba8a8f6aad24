use crate::frame::{Frame, FrameError};
use log::debug;
use rand_core::RngCore;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise while loading or writing a seed corpus.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing a directive file.
    #[error("Corpus I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line of a directive file is not a valid cansend directive.
    #[error("{path:?}, line {line}: {source}")]
    InvalidDirective {
        path: PathBuf,
        line: usize,
        #[source]
        source: FrameError,
    },
}

/// An ordered collection of known-valid frames.
///
/// The seed corpus feeds the mutation strategy (as parents) and the replay
/// strategy (as the exact send order). Entries keep their insertion order so
/// a candidate's parent index stays stable for the whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedCorpus {
    entries: Vec<Frame>,
}

impl SeedCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame and returns its index.
    pub fn add(&mut self, frame: Frame) -> usize {
        self.entries.push(frame);
        self.entries.len() - 1
    }

    pub fn get(&self, id: usize) -> Option<&Frame> {
        self.entries.get(id)
    }

    /// Selects an entry uniformly at random.
    ///
    /// Returns `None` when the corpus is empty.
    pub fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &Frame)> {
        if self.entries.is_empty() {
            return None;
        }
        let index = (rng.next_u64() % self.entries.len() as u64) as usize;
        self.entries.get(index).map(|frame| (index, frame))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.entries
    }

    /// Parses directive text, one frame per line.
    ///
    /// Blank lines and lines starting with `//` or `;` are skipped.
    pub fn parse_directives(text: &str, origin: &Path) -> Result<Self, CorpusError> {
        let mut corpus = SeedCorpus::new();
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with(';') {
                continue;
            }
            let frame =
                Frame::parse_directive(trimmed).map_err(|source| CorpusError::InvalidDirective {
                    path: origin.to_path_buf(),
                    line: line_no + 1,
                    source,
                })?;
            corpus.add(frame);
        }
        Ok(corpus)
    }

    /// Loads directives from a collection of files or directories.
    ///
    /// Files directly inside a directory are loaded in file-name order;
    /// subdirectories are not traversed.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<Self, CorpusError> {
        let mut corpus = SeedCorpus::new();
        for path in paths {
            if path.is_dir() {
                let mut files = Vec::new();
                for entry in fs::read_dir(path).map_err(|source| CorpusError::Io {
                    path: path.clone(),
                    source,
                })? {
                    let entry = entry.map_err(|source| CorpusError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    if entry.path().is_file() {
                        files.push(entry.path());
                    }
                }
                files.sort();
                for file in files {
                    corpus.extend_from_file(&file)?;
                }
            } else {
                corpus.extend_from_file(path)?;
            }
        }
        Ok(corpus)
    }

    fn extend_from_file(&mut self, path: &Path) -> Result<(), CorpusError> {
        let text = fs::read_to_string(path).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = Self::parse_directives(&text, path)?;
        debug!("Loaded {} seed frames from {:?}", loaded.len(), path);
        self.entries.extend(loaded.entries);
        Ok(())
    }

    /// Writes frames as directives, one per line.
    pub fn write_directives<'a>(
        path: &Path,
        frames: impl IntoIterator<Item = &'a Frame>,
    ) -> Result<usize, CorpusError> {
        let io_err = |source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = fs::File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for frame in frames {
            writeln!(writer, "{frame}").map_err(io_err)?;
            written += 1;
        }
        writer.flush().map_err(io_err)?;
        Ok(written)
    }
}

impl FromIterator<Frame> for SeedCorpus {
    fn from_iter<T: IntoIterator<Item = Frame>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn random_select_on_empty_corpus_returns_none() {
        let corpus = SeedCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(corpus.random_select(&mut rng).is_none());
    }

    #[test]
    fn random_select_eventually_visits_every_entry() {
        let corpus: SeedCorpus = [0x100u32, 0x200, 0x300]
            .into_iter()
            .map(|id| Frame::new(id, vec![0x01]).unwrap())
            .collect();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let (index, frame) = corpus.random_select(&mut rng).unwrap();
            assert_eq!(corpus.get(index), Some(frame));
            seen.insert(index);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn parse_directives_skips_comments_and_reports_line_numbers() {
        let text = "// header\n0x7DF#02 01 00\n\n; note\n7E0#0210\n";
        let corpus = SeedCorpus::parse_directives(text, Path::new("seeds.txt")).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(1).unwrap().id(), 0x7E0);

        let err = SeedCorpus::parse_directives("7DF#00\nnot-a-frame\n", Path::new("bad.txt"))
            .unwrap_err();
        match err {
            CorpusError::InvalidDirective { line, .. } => assert_eq!(line, 2),
            other => panic!("Expected InvalidDirective, got {other:?}"),
        }
    }

    #[test]
    fn write_then_load_directory_preserves_frames() {
        let dir = tempdir().unwrap();
        let frames = vec![
            Frame::new(0x123, vec![0xFF, 0x00]).unwrap(),
            Frame::new(0x456, Vec::<u8>::new()).unwrap(),
        ];
        let written = SeedCorpus::write_directives(&dir.path().join("a.txt"), &frames).unwrap();
        assert_eq!(written, 2);
        SeedCorpus::write_directives(&dir.path().join("b.txt"), &frames[..1]).unwrap();

        let corpus = SeedCorpus::load_from_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.frames()[..2], frames[..]);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = SeedCorpus::load_from_paths(&[PathBuf::from("/nonexistent/seeds.txt")])
            .unwrap_err();
        assert!(matches!(err, CorpusError::Io { .. }));
    }
}
