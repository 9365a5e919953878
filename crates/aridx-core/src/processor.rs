//! The bounded processing pool.
//!
//! CPU- and I/O-heavy work — content digests, byte-for-byte comparison,
//! metadata diffs — runs on blocking threads, with an admission semaphore
//! keeping at most `concurrency` jobs in flight. Everything else in the
//! system stays cooperative and treats these calls as suspension points.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::hashalg::HashAlgorithm;
use crate::metadata::{compare_file_metadata, FileMetadataDifference};

const COMPARE_BUFFER: usize = 64 * 1024;

pub struct Processor {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl Processor {
    /// `concurrency` defaults to the number of available cores.
    pub fn new(concurrency: Option<usize>) -> Self {
        let concurrency = concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("processor pool closed");
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|join_error| CoreError::TaskPanic(join_error.to_string()))
    }

    /// Digest of a file's content under the given algorithm.
    pub async fn digest(&self, algorithm: &'static HashAlgorithm, path: PathBuf) -> Result<Vec<u8>> {
        let digest = self.run(move || algorithm.compute(&path)).await??;
        Ok(digest)
    }

    /// Byte-for-byte content comparison.
    ///
    /// Read failures are downgraded to "different": a vanished or unreadable
    /// file must never merge into an equivalence class, and must not abort
    /// the surrounding run either.
    pub async fn compare_content(&self, a: PathBuf, b: PathBuf) -> Result<bool> {
        let outcome = self
            .run(move || match compare_content_blocking(&a, &b) {
                Ok(equal) => equal,
                Err(error) => {
                    debug!(%error, "content comparison failed, treating as different");
                    false
                }
            })
            .await?;
        Ok(outcome)
    }

    /// Typed metadata differences between two regular files.
    pub async fn compare_metadata(
        &self,
        a: PathBuf,
        b: PathBuf,
    ) -> Result<Vec<FileMetadataDifference>> {
        let diffs = self.run(move || compare_file_metadata(&a, &b)).await??;
        Ok(diffs)
    }
}

fn compare_content_blocking(a: &Path, b: &Path) -> io::Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = std::fs::File::open(a)?;
    let mut file_b = std::fs::File::open(b)?;
    let mut buf_a = vec![0u8; COMPARE_BUFFER];
    let mut buf_b = vec![0u8; COMPARE_BUFFER];

    loop {
        let read_a = read_full(&mut file_a, &mut buf_a)?;
        let read_b = read_full(&mut file_b, &mut buf_b)?;
        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}

fn read_full(file: &mut std::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashalg;
    use std::fs;

    #[tokio::test]
    async fn digest_and_compare() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, "same content").unwrap();
        fs::write(&b, "same content").unwrap();
        fs::write(&c, "other content").unwrap();

        let processor = Processor::new(Some(2));
        let algorithm = hashalg::lookup("sha256").unwrap();

        let digest_a = processor.digest(algorithm, a.clone()).await.unwrap();
        let digest_b = processor.digest(algorithm, b.clone()).await.unwrap();
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 32);

        assert!(processor.compare_content(a.clone(), b.clone()).await.unwrap());
        assert!(!processor.compare_content(a.clone(), c.clone()).await.unwrap());
    }

    #[tokio::test]
    async fn unreadable_file_compares_as_different() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, "x").unwrap();
        let missing = dir.path().join("missing");

        let processor = Processor::new(Some(1));
        assert!(!processor.compare_content(a, missing).await.unwrap());
    }

    #[tokio::test]
    async fn digest_of_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = Processor::new(Some(1));
        let algorithm = hashalg::lookup("sha256").unwrap();
        let result = processor.digest(algorithm, dir.path().join("missing")).await;
        assert!(matches!(result, Err(CoreError::Io(_))));
    }
}
