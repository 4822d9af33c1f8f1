use futures::{StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::UploadApi;
use crate::error::{Result, Stage, UploadError};
use crate::rest_types::{CommitInfo, FileMetadata};
use crate::session::{
    DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_DESTINATION_PREFIX, MAX_CHUNK_SIZE_BYTES, UploadSession,
    UploadTask, chunk_len,
};

/// What to do with a session that was opened but can no longer be committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AbandonPolicy {
    /// Leave the session open and let the provider expire it.
    #[default]
    Leave,
    /// Send a closing append before giving up on the file.
    Close,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    chunk_size: u64,
    prefix: String,
    abandon_policy: AbandonPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
            prefix: DEFAULT_DESTINATION_PREFIX.to_string(),
            abandon_policy: AbandonPolicy::default(),
        }
    }
}

impl UploadOptions {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE_BYTES {
            return Err(UploadError::InvalidChunkSize { size: chunk_size });
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_abandon_policy(mut self, policy: AbandonPolicy) -> Self {
        self.abandon_policy = policy;
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn abandon_policy(&self) -> AbandonPolicy {
        self.abandon_policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    SessionOpen,
    Streaming,
    Committing,
    Done,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct ChunkedUploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub enum UploadEvent {
    State(TaskState),
    Progress(ChunkedUploadProgress),
    Complete(FileMetadata),
}

/// Whole percent of `sent` over `total`, rounded to nearest.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((sent as f64 * 100.0 / total as f64).round() as u8).min(100)
}

async fn abandon_session<A: UploadApi + ?Sized>(api: &A, session: &UploadSession, file: &str) {
    debug!(file, session_id = %session.id(), offset = session.offset(), "abandoning session");
    if let Err(e) = api.abandon(session.cursor()).await {
        warn!(file, session_id = %session.id(), error = %e, "failed to close abandoned session");
    }
}

/// Drives one task through start, append and finish.
///
/// The stream ends with either `UploadEvent::Complete` or an error. Errors
/// after the session opened close the session when `options` ask for it;
/// cancellation always closes it.
pub fn upload_task<'a, A: UploadApi + ?Sized>(
    api: &'a A,
    task: &'a mut UploadTask,
    options: &'a UploadOptions,
    cancel: &'a CancellationToken,
) -> BoxStream<'a, Result<UploadEvent>> {
    let stream = async_stream::try_stream! {
        if cancel.is_cancelled() {
            Err(UploadError::Cancelled)?;
        }

        let total_bytes = task.total_size();
        let chunk_size = options.chunk_size();
        let close_on_failure = options.abandon_policy() == AbandonPolicy::Close;

        let session_id = api
            .start_session()
            .await
            .map_err(|e| e.with_file(task.name()))?;
        let mut session = UploadSession::new(session_id);
        yield UploadEvent::State(TaskState::SessionOpen);

        yield UploadEvent::State(TaskState::Streaming);
        yield UploadEvent::Progress(ChunkedUploadProgress {
            bytes_uploaded: 0,
            total_bytes,
        });

        while task.offset() < total_bytes {
            if cancel.is_cancelled() {
                abandon_session(api, &session, task.name()).await;
                Err(UploadError::Cancelled)?;
            }

            let prepared = match session.ensure_in_sync(task) {
                Ok(()) => {
                    let len = chunk_len(total_bytes, task.offset(), chunk_size);
                    task.read_chunk(len).await.map(|data| (len, data))
                }
                Err(e) => Err(e),
            };
            if prepared.is_err() && close_on_failure {
                abandon_session(api, &session, task.name()).await;
            }
            let (len, data) = prepared?;

            let base = task.offset();
            debug!(
                file = task.name(),
                session_id = %session.id(),
                offset = base,
                len,
                "appending chunk"
            );

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
            let append_fut = api.append(session.cursor(), data, progress_tx);
            tokio::pin!(append_fut);

            let mut sent = 0u64;
            let append_result: Result<()> = loop {
                tokio::select! {
                    biased;
                    result = &mut append_fut => {
                        break result;
                    }
                    Some(bytes) = progress_rx.recv() => {
                        sent = (sent + bytes).min(len);
                        yield UploadEvent::Progress(ChunkedUploadProgress {
                            bytes_uploaded: base + sent,
                            total_bytes,
                        });
                    }
                }
            };

            if let Err(e) = append_result {
                if close_on_failure {
                    abandon_session(api, &session, task.name()).await;
                }
                Err(e.with_file(task.name()))?;
            }

            task.advance(len);
            session.advance(len);
            yield UploadEvent::Progress(ChunkedUploadProgress {
                bytes_uploaded: task.offset(),
                total_bytes,
            });
        }

        if cancel.is_cancelled() {
            abandon_session(api, &session, task.name()).await;
            Err(UploadError::Cancelled)?;
        }

        if let Err(e) = session.ensure_in_sync(task) {
            if close_on_failure {
                abandon_session(api, &session, task.name()).await;
            }
            Err(e)?;
        }

        yield UploadEvent::State(TaskState::Committing);
        let commit = CommitInfo::add(task.destination(options.prefix()));
        match api.finish(session.cursor(), commit).await {
            Ok(metadata) => {
                session.close();
                yield UploadEvent::Complete(metadata);
            }
            Err(e) => {
                if close_on_failure {
                    abandon_session(api, &session, task.name()).await;
                }
                Err(e.with_file(task.name()))?;
            }
        }
    };

    Box::pin(stream)
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded(FileMetadata),
    Failed(UploadError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Succeeded(_) => TaskState::Done,
            Outcome::Failed(_) => TaskState::Failed,
        }
    }
}

#[derive(Debug)]
pub struct BatchEntry {
    pub task: UploadTask,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    entries: Vec<BatchEntry>,
}

impl BatchResult {
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.outcome.is_success())
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn failed(&self) -> impl Iterator<Item = (&UploadTask, &UploadError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Outcome::Failed(e) => Some((&entry.task, e)),
            Outcome::Succeeded(_) => None,
        })
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&UploadTask, &FileMetadata)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Outcome::Succeeded(meta) => Some((&entry.task, meta)),
            Outcome::Failed(_) => None,
        })
    }
}

impl FromIterator<BatchEntry> for BatchResult {
    fn from_iter<I: IntoIterator<Item = BatchEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Receives batch progress. Percent values for a task never decrease, and
/// 100 is only reported once its commit succeeded.
pub trait ProgressObserver {
    fn task_started(&mut self, _index: usize, _task: &UploadTask) {}

    fn progress(&mut self, index: usize, percent: u8);

    fn task_finished(&mut self, _index: usize, _task: &UploadTask, _outcome: &Outcome) {}
}

impl<F: FnMut(usize, u8)> ProgressObserver for F {
    fn progress(&mut self, index: usize, percent: u8) {
        self(index, percent)
    }
}

/// Uploads `tasks` one after another and records every outcome.
///
/// A failure only fails its own task. Once `cancel` fires, the task in
/// flight stops at the next chunk boundary and the remaining tasks are
/// recorded as cancelled without touching the network.
pub async fn run_batch<A, O>(
    api: &A,
    tasks: Vec<UploadTask>,
    options: &UploadOptions,
    observer: &mut O,
    cancel: &CancellationToken,
) -> BatchResult
where
    A: UploadApi + ?Sized,
    O: ProgressObserver + ?Sized,
{
    let mut entries = Vec::with_capacity(tasks.len());

    for (index, mut task) in tasks.into_iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(index, file = task.name(), "skipping task after cancellation");
            entries.push(BatchEntry {
                task,
                outcome: Outcome::Failed(UploadError::Cancelled),
            });
            continue;
        }

        debug!(index, file = task.name(), size = task.total_size(), state = ?TaskState::Pending, "task start");
        observer.task_started(index, &task);

        let mut reported: Option<u8> = None;
        let mut outcome = None;
        {
            let mut stream = upload_task(api, &mut task, options, cancel);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(UploadEvent::State(state)) => {
                        debug!(index, ?state, "task state");
                    }
                    Ok(UploadEvent::Progress(p)) => {
                        let pct = percent(p.bytes_uploaded, p.total_bytes).min(99);
                        let pct = reported.map_or(pct, |last| pct.max(last));
                        if reported != Some(pct) {
                            reported = Some(pct);
                            observer.progress(index, pct);
                        }
                    }
                    Ok(UploadEvent::Complete(metadata)) => {
                        outcome = Some(Outcome::Succeeded(metadata));
                    }
                    Err(e) => {
                        outcome = Some(Outcome::Failed(e));
                    }
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            Outcome::Failed(UploadError::Network {
                stage: Stage::Finish,
                file: task.name().to_string(),
                message: "upload ended without a commit".to_string(),
            })
        });

        match &outcome {
            Outcome::Succeeded(metadata) => {
                observer.progress(index, 100);
                info!(index, file = task.name(), stored_as = %metadata.name, "upload complete");
            }
            Outcome::Failed(e) => {
                warn!(index, file = task.name(), error = %e, "upload failed");
            }
        }

        observer.task_finished(index, &task, &outcome);
        entries.push(BatchEntry { task, outcome });
    }

    BatchResult { entries }
}
