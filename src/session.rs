use std::{
    fmt::Display,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, UploadError};
use crate::rest_types::UploadCursor;

const MEGABYTE: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 8 * MEGABYTE;
/// Dropbox rejects append bodies larger than 150 MiB.
pub const MAX_CHUNK_SIZE_BYTES: u64 = 150 * MEGABYTE;

pub const DEFAULT_DESTINATION_PREFIX: &str = "galeria";

/// Number of append calls needed to stream `total_size` bytes.
pub fn append_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Length of the chunk starting at `offset`, clamped to the end of the file.
pub fn chunk_len(total_size: u64, offset: u64, chunk_size: u64) -> u64 {
    chunk_size.min(total_size.saturating_sub(offset))
}

/// Immutable, byte-addressable file content.
#[derive(Debug, Clone)]
pub enum ContentSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ContentSource {
    pub async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        match self {
            ContentSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len as usize];
                file.read_exact(&mut buffer).await?;
                Ok(buffer)
            }
            ContentSource::Memory(bytes) => {
                let start = offset as usize;
                let end = start + len as usize;
                bytes.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range {start}..{end} past end of {} bytes", bytes.len()),
                    )
                })
            }
        }
    }
}

/// One file to transfer.
#[derive(Debug, Clone)]
pub struct UploadTask {
    name: String,
    source: ContentSource,
    total_size: u64,
    offset: u64,
}

impl UploadTask {
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::Io {
                file: display.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path has no file name",
                ),
            })?;

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| UploadError::Io {
                file: display.clone(),
                source,
            })?;

        if !metadata.is_file() {
            return Err(UploadError::Io {
                file: display,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file"),
            });
        }

        Ok(Self {
            name,
            source: ContentSource::File(path.to_path_buf()),
            total_size: metadata.len(),
            offset: 0,
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            total_size: bytes.len() as u64,
            source: ContentSource::Memory(bytes),
            offset: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_fully_sent(&self) -> bool {
        self.offset == self.total_size
    }

    pub fn source(&self) -> &ContentSource {
        &self.source
    }

    /// `/<prefix>/<file name>`, or `/<file name>` for an empty prefix.
    pub fn destination(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", self.name)
        } else {
            format!("/{}/{}", prefix, self.name)
        }
    }

    pub(crate) async fn read_chunk(&self, len: u64) -> Result<Vec<u8>> {
        self.source
            .read_range(self.offset, len)
            .await
            .map_err(|source| UploadError::Io {
                file: self.name.clone(),
                source,
            })
    }

    pub(crate) fn advance(&mut self, sent: u64) {
        debug_assert!(self.offset + sent <= self.total_size);
        self.offset += sent;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side transfer context owned by the coordinator for one task.
#[derive(Debug)]
pub struct UploadSession {
    id: SessionId,
    offset: u64,
    closed: bool,
}

impl UploadSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            offset: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn cursor(&self) -> UploadCursor {
        UploadCursor {
            session_id: self.id.as_str().to_string(),
            offset: self.offset,
        }
    }

    pub(crate) fn ensure_in_sync(&self, task: &UploadTask) -> Result<()> {
        if self.offset != task.offset() {
            return Err(UploadError::Desync {
                file: task.name().to_string(),
                session_offset: self.offset,
                task_offset: task.offset(),
            });
        }
        Ok(())
    }

    pub(crate) fn advance(&mut self, sent: u64) {
        self.offset += sent;
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

/// Files selected for the next batch, unique by name.
#[derive(Debug, Default)]
pub struct PendingSet {
    tasks: Vec<UploadTask>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a task with the same name is already pending.
    pub fn add(&mut self, task: UploadTask) -> bool {
        if self.tasks.iter().any(|t| t.name() == task.name()) {
            return false;
        }
        self.tasks.push(task);
        true
    }

    pub fn discard(&mut self, index: usize) -> Option<UploadTask> {
        (index < self.tasks.len()).then(|| self.tasks.remove(index))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[UploadTask] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<UploadTask> {
        self.tasks
    }
}
