//! Artifact copies into `run_dir/artifacts/`.
//!
//! Copies run in fixed-size chunks driven by the background writer, one
//! [`ArtifactCopier::step`] at a time, so a multi-gigabyte checkpoint does
//! not hold up metric flushes. Bytes land in a `.partial` sibling that is
//! renamed over the destination once the copy is complete.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::channel::ArtifactEvent;
use crate::error::{Result, RuntrackError};
use crate::storage::staging_path;

/// Where an artifact should land, relative to `artifacts/`.
///
/// An explicit destination must be a plain relative path. Otherwise a
/// relative source keeps its structure (`ckpt/model.bin` stays
/// `ckpt/model.bin`); absolute sources and sources that climb out with `..`
/// keep only their file name.
pub fn relative_destination(src: &Path, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dest) = explicit {
        return normal_components(dest).ok_or_else(|| {
            RuntrackError::InvalidInput(format!(
                "artifact destination must be a relative path without `..`: {}",
                dest.display()
            ))
        });
    }
    if src.is_relative() {
        if let Some(rel) = normal_components(src) {
            return Ok(rel);
        }
    }
    src.file_name().map(PathBuf::from).ok_or_else(|| {
        RuntrackError::InvalidInput(format!("artifact path has no file name: {}", src.display()))
    })
}

fn normal_components(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Outcome of one [`ArtifactCopier::step`].
#[derive(Debug)]
pub enum CopyProgress {
    Idle,
    Copying,
    Done { dest: PathBuf, bytes: u64 },
    Failed(RuntrackError),
}

struct CopyJob {
    src: PathBuf,
    dest: PathBuf,
    staging: PathBuf,
    reader: File,
    writer: File,
    bytes: u64,
}

impl CopyJob {
    fn error(&self, reason: impl ToString) -> RuntrackError {
        RuntrackError::ArtifactCopy {
            src: self.src.clone(),
            dest: self.dest.clone(),
            reason: reason.to_string(),
        }
    }

    fn abandon(self, reason: impl ToString) -> RuntrackError {
        let err = self.error(reason);
        let _ = fs::remove_file(&self.staging);
        err
    }
}

pub struct ArtifactCopier {
    root: PathBuf,
    queue: VecDeque<ArtifactEvent>,
    active: Option<CopyJob>,
    buf: Vec<u8>,
}

impl ArtifactCopier {
    pub fn new(root: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        Self {
            root: root.into(),
            queue: VecDeque::new(),
            active: None,
            buf: vec![0; chunk_bytes.max(1)],
        }
    }

    pub fn enqueue(&mut self, event: ArtifactEvent) {
        self.queue.push_back(event);
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    /// Start the next queued copy if needed, then move one chunk.
    pub fn step(&mut self) -> CopyProgress {
        if self.active.is_none() {
            let Some(event) = self.queue.pop_front() else {
                return CopyProgress::Idle;
            };
            match self.start(event) {
                Ok(job) => self.active = Some(job),
                Err(e) => return CopyProgress::Failed(e),
            }
        }

        let Some(job) = self.active.as_mut() else {
            return CopyProgress::Idle;
        };
        match job.reader.read(&mut self.buf) {
            Ok(0) => self.finish(),
            Ok(n) => match job.writer.write_all(&self.buf[..n]) {
                Ok(()) => {
                    job.bytes += n as u64;
                    CopyProgress::Copying
                }
                Err(e) => self.fail(e),
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => CopyProgress::Copying,
            Err(e) => self.fail(e),
        }
    }

    /// Run every queued copy to completion.
    pub fn finish_all(&mut self) -> Vec<CopyProgress> {
        let mut outcomes = vec![];
        loop {
            match self.step() {
                CopyProgress::Idle => return outcomes,
                CopyProgress::Copying => {}
                done => outcomes.push(done),
            }
        }
    }

    fn start(&self, event: ArtifactEvent) -> Result<CopyJob> {
        let dest = self.root.join(&event.dest);
        let err = |reason: String| RuntrackError::ArtifactCopy {
            src: event.src.clone(),
            dest: dest.clone(),
            reason,
        };

        if normal_components(&event.dest).is_none() {
            return Err(err("destination escapes the artifacts directory".into()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| err(e.to_string()))?;
        }
        let reader = File::open(&event.src).map_err(|e| err(e.to_string()))?;
        let staging = staging_path(&dest, ".partial");
        let writer = File::create(&staging).map_err(|e| err(e.to_string()))?;

        Ok(CopyJob {
            src: event.src,
            dest,
            staging,
            reader,
            writer,
            bytes: 0,
        })
    }

    fn finish(&mut self) -> CopyProgress {
        let Some(job) = self.active.take() else {
            return CopyProgress::Idle;
        };
        if let Err(e) = job.writer.sync_all() {
            return CopyProgress::Failed(job.abandon(e));
        }
        if let Err(e) = fs::rename(&job.staging, &job.dest) {
            return CopyProgress::Failed(job.abandon(e));
        }
        CopyProgress::Done {
            dest: job.dest,
            bytes: job.bytes,
        }
    }

    fn fail(&mut self, e: std::io::Error) -> CopyProgress {
        match self.active.take() {
            Some(job) => CopyProgress::Failed(job.abandon(e)),
            None => CopyProgress::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(src: &Path, dest: &str) -> ArtifactEvent {
        ArtifactEvent {
            src: src.to_path_buf(),
            dest: PathBuf::from(dest),
        }
    }

    #[test]
    fn destination_rules() {
        assert_eq!(
            relative_destination(Path::new("ckpt/model.bin"), None).unwrap(),
            PathBuf::from("ckpt/model.bin")
        );
        assert_eq!(
            relative_destination(Path::new("./model.txt"), None).unwrap(),
            PathBuf::from("model.txt")
        );
        assert_eq!(
            relative_destination(Path::new("/tmp/x/model.txt"), None).unwrap(),
            PathBuf::from("model.txt")
        );
        assert_eq!(
            relative_destination(Path::new("../up/model.txt"), None).unwrap(),
            PathBuf::from("model.txt")
        );
        assert_eq!(
            relative_destination(Path::new("/tmp/x/model.txt"), Some(Path::new("best/m.txt")))
                .unwrap(),
            PathBuf::from("best/m.txt")
        );
        assert!(relative_destination(Path::new("a"), Some(Path::new("../evil"))).is_err());
        assert!(relative_destination(Path::new("/"), None).is_err());
    }

    #[test]
    fn chunked_copy_preserves_bytes_and_structure() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("weights.bin");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &payload).unwrap();

        let root = tmp.path().join("artifacts");
        let mut copier = ArtifactCopier::new(&root, 1024);
        copier.enqueue(event(&src, "ckpt/epoch1/weights.bin"));

        let mut chunks = 0;
        let outcome = loop {
            match copier.step() {
                CopyProgress::Copying => chunks += 1,
                other => break other,
            }
        };
        assert!(chunks >= 10, "expected chunked copy, got {chunks} steps");
        match outcome {
            CopyProgress::Done { dest, bytes } => {
                assert_eq!(bytes, payload.len() as u64);
                assert_eq!(fs::read(dest).unwrap(), payload);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!copier.is_busy());
        assert!(!root.join("ckpt/epoch1/weights.bin.partial").exists());
    }

    #[test]
    fn missing_source_fails_and_next_copy_proceeds() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.txt");
        fs::write(&good, "ok").unwrap();

        let mut copier = ArtifactCopier::new(tmp.path().join("artifacts"), 64);
        copier.enqueue(event(&tmp.path().join("missing.txt"), "missing.txt"));
        copier.enqueue(event(&good, "good.txt"));

        let outcomes = copier.finish_all();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], CopyProgress::Failed(RuntrackError::ArtifactCopy { .. })));
        assert!(matches!(outcomes[1], CopyProgress::Done { bytes: 2, .. }));
    }

    #[test]
    fn overwrites_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("artifacts");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("notes.txt"), "old contents that are longer").unwrap();
        let src = tmp.path().join("notes.txt");
        fs::write(&src, "new").unwrap();

        let mut copier = ArtifactCopier::new(&root, 4096);
        copier.enqueue(event(&src, "notes.txt"));
        copier.finish_all();
        assert_eq!(fs::read_to_string(root.join("notes.txt")).unwrap(), "new");
    }
}
