//! Enrollment images on disk: `root/<identity>/<image>.{jpg,jpeg,png}`.

use presence_core::{CorpusEntry, CorpusError, CorpusReader, FreshnessMarker, Identity};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Directory-backed corpus, one subdirectory per identity.
#[derive(Debug, Clone)]
pub struct DirCorpus {
    root: PathBuf,
}

impl DirCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_root(&self) -> Result<(), CorpusError> {
        let meta = std::fs::metadata(&self.root).map_err(|e| self.unreadable(e))?;
        if !meta.is_dir() {
            return Err(self.unreadable("not a directory"));
        }
        Ok(())
    }

    fn unreadable(&self, reason: impl ToString) -> CorpusError {
        CorpusError::Unreadable {
            path: self.root.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Whether `path` has an extension the corpus treats as an image.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

impl CorpusReader for DirCorpus {
    /// Newest modification time of any file or directory under the root.
    ///
    /// Directories count so that deleting an image also moves the marker.
    fn marker(&self) -> Result<FreshnessMarker, CorpusError> {
        self.check_root()?;

        let mut latest = FreshnessMarker::ZERO;
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.depth() == 0 => return Err(self.unreadable(e)),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable corpus entry");
                    continue;
                }
            };
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok());
            if let Some(modified) = modified {
                latest = latest.max(FreshnessMarker::from_system_time(modified));
            }
        }
        Ok(latest)
    }

    fn entries(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
        self.check_root()?;

        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable corpus entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }

            let Some(identity) = entry
                .path()
                .parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str())
            else {
                tracing::warn!(path = %entry.path().display(), "identity directory name is not UTF-8; skipping");
                continue;
            };

            entries.push(CorpusEntry {
                identity: Identity::new(identity),
                source: entry.path().to_string_lossy().into_owned(),
            });
        }

        tracing::debug!(root = %self.root.display(), images = entries.len(), "listed corpus");
        Ok(entries)
    }

    fn read(&self, entry: &CorpusEntry) -> Result<Vec<u8>, CorpusError> {
        std::fs::read(&entry.source).map_err(|e| CorpusError::Image {
            path: entry.source.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn layout(root: &Path) {
        fs::create_dir_all(root.join("Ana")).unwrap();
        fs::create_dir_all(root.join("Ben")).unwrap();
        fs::create_dir_all(root.join("Empty")).unwrap();
        fs::write(root.join("Ana/2.JPG"), b"jpeg").unwrap();
        fs::write(root.join("Ana/1.png"), b"png").unwrap();
        fs::write(root.join("Ana/notes.txt"), b"ignored").unwrap();
        fs::write(root.join("Ben/a.jpeg"), b"jpeg").unwrap();
        fs::write(root.join("stray.jpg"), b"top-level file").unwrap();
    }

    #[test]
    fn test_entries_follow_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());

        let corpus = DirCorpus::new(dir.path());
        let entries = corpus.entries().unwrap();
        let pairs: Vec<(String, String)> = entries
            .iter()
            .map(|e| {
                let file = Path::new(&e.source).file_name().unwrap().to_string_lossy().into_owned();
                (e.identity.to_string(), file)
            })
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("Ana".to_string(), "1.png".to_string()),
                ("Ana".to_string(), "2.JPG".to_string()),
                ("Ben".to_string(), "a.jpeg".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_returns_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());

        let corpus = DirCorpus::new(dir.path());
        let entry = corpus.entries().unwrap().remove(0);
        assert_eq!(corpus.read(&entry).unwrap(), b"png");

        let missing = CorpusEntry {
            identity: "Ana".into(),
            source: dir.path().join("Ana/gone.png").to_string_lossy().into_owned(),
        };
        assert!(matches!(corpus.read(&missing), Err(CorpusError::Image { .. })));
    }

    #[test]
    fn test_marker_is_newest_mtime() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());

        let expected = WalkDir::new(dir.path())
            .into_iter()
            .map(|e| FreshnessMarker::from_system_time(e.unwrap().metadata().unwrap().modified().unwrap()))
            .max()
            .unwrap();

        let corpus = DirCorpus::new(dir.path());
        assert_eq!(corpus.marker().unwrap(), expected);
        assert!(corpus.marker().unwrap() > FreshnessMarker::ZERO);
    }

    #[test]
    fn test_marker_never_decreases_when_images_are_added() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        let corpus = DirCorpus::new(dir.path());
        let before = corpus.marker().unwrap();

        fs::create_dir_all(dir.path().join("Cleo")).unwrap();
        fs::write(dir.path().join("Cleo/1.png"), b"png").unwrap();
        let new_file = fs::metadata(dir.path().join("Cleo/1.png")).unwrap().modified().unwrap();

        let after = corpus.marker().unwrap();
        assert!(after >= before);
        assert!(after >= FreshnessMarker::from_system_time(new_file));
    }

    #[test]
    fn test_missing_root_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = DirCorpus::new(dir.path().join("nope"));
        assert!(matches!(corpus.marker(), Err(CorpusError::Unreadable { .. })));
        assert!(matches!(corpus.entries(), Err(CorpusError::Unreadable { .. })));
    }

    #[test]
    fn test_image_extensions() {
        assert!(is_image(Path::new("a/b.jpg")));
        assert!(is_image(Path::new("a/b.PNG")));
        assert!(!is_image(Path::new("a/b.gif")));
        assert!(!is_image(Path::new("a/jpg")));
    }
}
