use crate::types::Set;
use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::RwLock,
};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("set {number} not found")]
    NotFound {
        number: u64,
        /// Lines the scan could not decode; non-zero hints at corruption.
        malformed: usize,
    },
    #[error("failed to open store {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to encode set: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Append-only log of processed sets, one JSON record per line.
///
/// Appends are serialized by the writer lock and numbered from an atomic
/// counter recovered at open. Lookups open their own handle and only hold
/// the shared lock while doing so.
pub struct FileStore {
    path: PathBuf,
    file: RwLock<File>,
    counter: AtomicU64,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let last = last_number_in(&path)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        // A torn last record must not swallow the next append.
        let torn = ends_mid_record(&path).await.map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        if torn {
            warn!(path = %path.display(), "store ends with a partial record, terminating it");
            let terminated = match file.write_all(b"\n").await {
                Ok(()) => file.sync_data().await,
                Err(e) => Err(e),
            };
            terminated.map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;
        }

        info!(path = %path.display(), last, "store opened");

        Ok(Self {
            path,
            file: RwLock::new(file),
            counter: AtomicU64::new(last),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest number handed out so far; 0 for an empty store.
    pub fn last_number(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Numbers `set`, writes it and syncs it to disk. Returns the number.
    pub async fn append(&self, set: &mut Set) -> Result<u64, StoreError> {
        let mut file = self.file.write().await;

        set.number = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let mut line = serde_json::to_vec(set)?;
        line.push(b'\n');

        file.write_all(&line).await?;
        file.sync_data().await?;

        Ok(set.number)
    }

    pub async fn find_by_number(&self, number: u64) -> Result<Set, StoreError> {
        let file = {
            let _guard = self.file.read().await;
            File::open(&self.path).await?
        };

        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        let mut malformed = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            match serde_json::from_str::<Set>(&line) {
                Ok(set) if set.number == number => return Ok(set),
                Ok(_) => {}
                Err(e) => {
                    malformed += 1;
                    warn!(path = %self.path.display(), line = line_no, error = %e, "skipping malformed record");
                }
            }
        }

        Err(StoreError::NotFound { number, malformed })
    }
}

/// True when the file is non-empty and its last byte is not a newline.
async fn ends_mid_record(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

async fn last_number_in(path: &Path) -> io::Result<u64> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut lines = BufReader::new(file).lines();
    let mut last = 0;
    while let Some(line) = lines.next_line().await? {
        if let Ok(set) = serde_json::from_str::<Set>(&line) {
            last = last.max(set.number);
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample(domains: &[&str], statuses: &[bool]) -> Set {
        let mut set = Set::from_domains(domains.iter().copied());
        set.apply_statuses(statuses);
        set
    }

    #[tokio::test]
    async fn append_then_find_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("links.jsonl")).await.unwrap();

        let mut set = sample(&["a.com", "b.net"], &[true, false]);
        let number = store.append(&mut set).await.unwrap();
        assert_eq!(number, 1);

        let found = store.find_by_number(number).await.unwrap();
        assert_eq!(found, set);
    }

    #[tokio::test]
    async fn missing_number_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("links.jsonl")).await.unwrap();
        store.append(&mut sample(&["a.com"], &[true])).await.unwrap();

        let err = store.find_by_number(42).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { number: 42, malformed: 0 }));
    }

    #[tokio::test]
    async fn counter_resumes_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.jsonl");
        {
            let store = FileStore::open(&path).await.unwrap();
            for _ in 0..3 {
                store.append(&mut sample(&["a.com"], &[true])).await.unwrap();
            }
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.last_number(), 3);
        let mut set = sample(&["b.com"], &[false]);
        assert_eq!(store.append(&mut set).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.jsonl");
        tokio::fs::write(
            &path,
            "{\"number\":1,\"links\":[]}\nnot json at all\n{\"number\":5,\"links\":[{\"domain\":\"x.io\",\"status\":true}]}\n{\"number\":6,\"li",
        )
        .await
        .unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.last_number(), 5);

        let found = store.find_by_number(5).await.unwrap();
        assert_eq!(found.links[0].domain, "x.io");

        let err = store.find_by_number(6).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { number: 6, malformed: 2 }));
    }

    #[tokio::test]
    async fn append_after_torn_record_is_findable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.jsonl");
        tokio::fs::write(&path, "{\"number\":1,\"links\":[]}\n{\"number\":2,\"li")
            .await
            .unwrap();

        let store = FileStore::open(&path).await.unwrap();
        let mut set = sample(&["after-restart.com"], &[true]);
        let number = store.append(&mut set).await.unwrap();
        assert_eq!(number, 2);

        assert_eq!(store.find_by_number(2).await.unwrap(), set);
        let err = store.find_by_number(3).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { number: 3, malformed: 1 }));

        // reopening a clean file adds nothing
        drop(store);
        let before = tokio::fs::read(&path).await.unwrap();
        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), before);
        assert_eq!(store.last_number(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_increasing_numbers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.jsonl");
        let store = Arc::new(FileStore::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let name = format!("d{i}.com");
                let mut set = sample(&[name.as_str()], &[i % 2 == 0]);
                store.append(&mut set).await.unwrap()
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<u64>>());

        // on-disk order matches numbering order
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let on_disk: Vec<u64> = content
            .lines()
            .map(|l| serde_json::from_str::<Set>(l).unwrap().number)
            .collect();
        assert_eq!(on_disk, (1..=20).collect::<Vec<u64>>());
    }
}
