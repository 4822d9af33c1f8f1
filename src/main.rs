use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use dbxup::{
    AbandonPolicy, BatchResult, DropboxClient, DropboxTokenProvider, KeyringTokenCache, Outcome, PendingSet,
    ProgressObserver, TokenProvider, UploadTask, run_batch,
    config::{self, Config, ConfigFile, KEYRING_ACCESS_TOKEN_USER, KEYRING_SERVICE},
};
use iocraft::prelude::*;
use std::{
    io::{self, Write},
    path::PathBuf,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::ui::{
    BatchProgress, BatchSummary, BatchView, ConfigHeader, ErrorMessage, FileRow, InputPrompt,
    RowStatus, SuccessMessage,
};

mod ui;

const MEGABYTE: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "dbxup")]
#[command(version)]
#[command(about = "Stage local files to Dropbox through resumable upload sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files, one session per file
    Upload {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
        /// Destination folder, files land at /<prefix>/<file name>
        #[arg(short, long)]
        prefix: Option<String>,
        /// Bytes sent per append request, in MiB
        #[arg(short, long)]
        chunk_size_mib: Option<u64>,
        /// Close the session of a file that failed mid-upload
        #[arg(long)]
        close_abandoned: bool,
        /// Skip the progress display
        #[arg(short, long)]
        quiet: bool,
    },
    /// Configure dbxup interactively
    Config,
    /// Store your Dropbox refresh token in the OS keyring
    SetRefreshToken { refresh_token: String },
    /// Check which account the current credentials belong to
    Token {
        /// Exchange the refresh token even if the cached token is valid
        #[arg(short, long)]
        refresh: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dbxup=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();

    rt.block_on(async {
        match cli.command {
            Commands::Config => interactive_config(),
            Commands::SetRefreshToken { refresh_token } => {
                config::set_refresh_token_keyring(refresh_token)
            }
            Commands::Token { refresh } => {
                let config = config::read_config()?;
                show_account(&config, refresh).await
            }
            Commands::Upload {
                files,
                prefix,
                chunk_size_mib,
                close_abandoned,
                quiet,
            } => {
                let config = config::read_config()?;
                upload_files(&config, files, prefix, chunk_size_mib, close_abandoned, quiet).await
            }
        }
    })
}

fn token_provider(config: &Config) -> DropboxTokenProvider {
    let mut provider =
        DropboxTokenProvider::new(config.api_base_url.clone(), config.oauth_base_url.clone())
            .with_cache(Box::new(KeyringTokenCache::new(
                KEYRING_SERVICE,
                KEYRING_ACCESS_TOKEN_USER,
            )));
    if let Some(app) = config.oauth_app() {
        provider = provider.with_app(app);
    }
    if let Some(token) = &config.access_token {
        provider = provider.with_fixed_token(token.clone());
    }
    provider
}

async fn show_account(config: &Config, refresh: bool) -> Result<()> {
    let provider = token_provider(config);
    let token = if refresh {
        provider.refresh().await?
    } else {
        provider.token().await?
    };

    let account = provider.current_account(&token).await?;
    let message = match account.email {
        Some(email) => format!("Authenticated as {} ({})", account.name.display_name, email),
        None => format!("Authenticated as {}", account.name.display_name),
    };
    element!(SuccessMessage(message: message)).print();
    Ok(())
}

/// Mirrors batch progress into the view rendered by [`BatchProgress`].
struct ViewObserver {
    tx: watch::Sender<BatchView>,
}

impl ProgressObserver for ViewObserver {
    fn task_started(&mut self, index: usize, _task: &UploadTask) {
        self.tx
            .send_modify(|view| view.files[index].status = RowStatus::Active);
    }

    fn progress(&mut self, index: usize, percent: u8) {
        self.tx
            .send_modify(|view| view.files[index].percent = percent);
    }

    fn task_finished(&mut self, index: usize, _task: &UploadTask, outcome: &Outcome) {
        let status = if outcome.is_success() {
            RowStatus::Done
        } else {
            RowStatus::Failed
        };
        self.tx.send_modify(|view| view.files[index].status = status);
    }
}

async fn upload_files(
    config: &Config,
    files: Vec<PathBuf>,
    prefix: Option<String>,
    chunk_size_mib: Option<u64>,
    close_abandoned: bool,
    quiet: bool,
) -> Result<()> {
    let mut pending = PendingSet::new();
    for path in files {
        let task = UploadTask::from_path(&path)
            .await
            .with_context(|| format!("Unable to read {}", path.display()))?;
        let name = task.name().to_string();
        if !pending.add(task) {
            warn!(file = %name, "skipping duplicate file name");
        }
    }

    if pending.is_empty() {
        bail!("No files selected");
    }

    let policy = if close_abandoned {
        AbandonPolicy::Close
    } else {
        AbandonPolicy::Leave
    };
    let mut options = config.upload_options(policy)?;
    if let Some(mib) = chunk_size_mib {
        options = options.with_chunk_size(mib.saturating_mul(MEGABYTE))?;
    }
    if let Some(prefix) = prefix {
        options = options.with_prefix(prefix);
    }

    let token = token_provider(config)
        .token()
        .await
        .context("Unable to obtain a Dropbox access token")?;
    let client = DropboxClient::new(config.content_base_url.clone(), token);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let rows = pending
        .tasks()
        .iter()
        .map(|task| FileRow {
            name: task.name().to_string(),
            size: task.total_size(),
            ..Default::default()
        })
        .collect();
    let (tx, rx) = watch::channel(BatchView { files: rows });
    let mut observer = ViewObserver { tx };

    let started = Instant::now();
    let batch = run_batch(&client, pending.into_tasks(), &options, &mut observer, &cancel);
    tokio::pin!(batch);

    let result = if quiet {
        batch.await
    } else {
        let mut progress_bar = element!(BatchProgress(
            title: format!("Uploading to /{}", options.prefix().trim_matches('/')),
            progress: Some(rx)
        ));
        tokio::select! {
            result = &mut batch => result,
            _ = progress_bar.render_loop() => batch.await,
        }
    };
    let elapsed = Duration::from_secs(started.elapsed().as_secs());

    let (succeeded, failed) = summary_rows(&result);

    element!(BatchSummary(
        succeeded: succeeded,
        failed: failed,
        elapsed: humantime::format_duration(elapsed).to_string()
    ))
    .print();

    if !result.is_success() {
        bail!(
            "{} of {} file(s) failed to upload",
            result.failed_count(),
            result.len()
        );
    }

    Ok(())
}

/// (local name, stored name) for each success and (local name, error) for
/// each failure.
fn summary_rows(result: &BatchResult) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let succeeded: Vec<(String, String)> = result
        .succeeded()
        .map(|(task, meta)| (task.name().to_string(), meta.name.clone()))
        .collect();
    let failed: Vec<(String, String)> = result
        .failed()
        .map(|(task, error)| (task.name().to_string(), error.to_string()))
        .collect();
    (succeeded, failed)
}

fn read_input(prompt: &str, default: Option<&str>, description: Option<&str>) -> Result<String> {
    element! {
        InputPrompt(
            prompt: prompt.to_string(),
            default: default.map(|s| s.to_string()),
            description: description.map(|s| s.to_string())
        )
    }
    .print();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    if input.is_empty() {
        if let Some(def) = default {
            Ok(def.to_string())
        } else {
            Ok(input)
        }
    } else {
        Ok(input)
    }
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn interactive_config() -> Result<()> {
    element!(ConfigHeader()).print();

    let app_key = loop {
        let app_key = read_input(
            "App key",
            None,
            Some("The key of your Dropbox app, from the App Console"),
        )?;

        if app_key.is_empty() {
            element!(ErrorMessage(message: "App key cannot be empty".to_string())).print();
            println!();
        } else {
            break app_key;
        }
    };

    let app_secret = read_input("App secret", None, Some("The secret of your Dropbox app"))?;

    let refresh_token = read_input(
        "Refresh token",
        None,
        Some("Optional: a long-lived refresh token (stored securely in OS keyring)"),
    )?;

    let destination_prefix = read_input(
        "Destination folder",
        Some(dbxup::session::DEFAULT_DESTINATION_PREFIX),
        Some("Files are committed to /<folder>/<file name>"),
    )?;

    let chunk_size_mib = loop {
        let input = read_input(
            "Chunk size (MiB)",
            Some("8"),
            Some("Bytes sent per append request, between 1 and 150"),
        )?;

        match input.parse::<u64>() {
            Ok(mib) if (1..=150).contains(&mib) => break mib,
            _ => {
                element!(ErrorMessage(message: format!("Invalid chunk size: {}", input))).print();
                println!();
            }
        }
    };

    if let Some(refresh_token) = optional(refresh_token) {
        config::set_refresh_token_keyring(refresh_token)?;
    }

    let update = ConfigFile {
        app_key: Some(app_key),
        app_secret: optional(app_secret),
        destination_prefix: optional(destination_prefix),
        chunk_size_mib: Some(chunk_size_mib),
        ..Default::default()
    };

    config::update_config(update)?;

    element!(SuccessMessage(message: "Configuration complete!".to_string())).print();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbxup::{BatchEntry, UploadError, rest_types::FileMetadata};

    #[test]
    fn summary_rows_split_successes_and_failures() {
        let result: BatchResult = vec![
            BatchEntry {
                task: UploadTask::from_bytes("a.jpg", vec![1u8, 2, 3]),
                outcome: Outcome::Succeeded(FileMetadata {
                    name: "a (1).jpg".to_string(),
                    id: None,
                    path_display: None,
                    size: Some(3),
                }),
            },
            BatchEntry {
                task: UploadTask::from_bytes("b.jpg", vec![4u8]),
                outcome: Outcome::Failed(UploadError::Cancelled),
            },
        ]
        .into_iter()
        .collect();

        let (succeeded, failed) = summary_rows(&result);
        assert_eq!(
            succeeded,
            vec![("a.jpg".to_string(), "a (1).jpg".to_string())]
        );
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "b.jpg");
        assert_eq!(failed[0].1, UploadError::Cancelled.to_string());
    }
}
