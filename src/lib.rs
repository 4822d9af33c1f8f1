//! Stages local files to Dropbox through resumable upload sessions.
//!
//! Files are streamed one at a time in bounded chunks: a session is opened,
//! appended to in offset order and committed under a destination prefix. A
//! failure only fails the file it happened on; [`run_batch`] always returns
//! a [`BatchResult`] covering every file it was given.

pub mod batch;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod rest_types;
pub mod session;

pub use batch::{
    AbandonPolicy, BatchEntry, BatchResult, Outcome, ProgressObserver, TaskState, UploadEvent,
    UploadOptions, run_batch, upload_task,
};
pub use client::{DropboxClient, UploadApi};
pub use credentials::{DropboxTokenProvider, KeyringTokenCache, TokenProvider};
pub use error::{Result, Stage, UploadError};
pub use session::{PendingSet, UploadSession, UploadTask};
