use iocraft::prelude::*;
use tokio::sync::watch;

const BAR_WIDTH: usize = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowStatus {
    #[default]
    Queued,
    Active,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct FileRow {
    pub name: String,
    pub size: u64,
    pub percent: u8,
    pub status: RowStatus,
}

#[derive(Debug, Clone, Default)]
pub struct BatchView {
    pub files: Vec<FileRow>,
}

impl BatchView {
    pub fn sent_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, RowStatus::Done | RowStatus::Failed))
            .count()
    }
}

fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

fn bar(percent: u8) -> String {
    let filled = (percent as usize * BAR_WIDTH) / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

#[derive(Default, Props)]
struct FileRowViewProps {
    row: Option<FileRow>,
}

#[component]
fn FileRowView(props: &FileRowViewProps) -> impl Into<AnyElement<'static>> {
    let row = props.row.clone().unwrap_or_default();
    let (icon, color) = match row.status {
        RowStatus::Queued => ("·", Color::Reset),
        RowStatus::Active => ("◆", Color::Cyan),
        RowStatus::Done => ("✓", Color::Green),
        RowStatus::Failed => ("✗", Color::Red),
    };

    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: color, content: format!("{} ", icon))
            Text(color: color, content: bar(row.percent))
            Text(content: format!(" {:>3}% ", row.percent))
            Text(weight: Weight::Bold, content: row.name.clone())
            Text(content: format!("  {}", format_size(row.size)))
        }
    }
}

#[derive(Default, Props)]
pub struct BatchProgressProps {
    pub title: String,
    pub progress: Option<watch::Receiver<BatchView>>,
}

#[component]
pub fn BatchProgress(props: &BatchProgressProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let initial = props
        .progress
        .as_ref()
        .map(|rx| rx.borrow().clone())
        .unwrap_or_default();
    let mut view = hooks.use_state(move || initial);
    let progress = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut rx) = progress else {
            return;
        };
        loop {
            let current = rx.borrow_and_update().clone();
            view.set(current);
            if rx.changed().await.is_err() {
                break;
            }
        }
    });

    let view = view.read().clone();
    let total = view.files.len();
    let sent = view.sent_count();

    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(content: "┌ ")
                View(background_color: Color::Blue) {
                    Text(content: &props.title, color: Color::White)
                }
            }
            #(view.files.into_iter().map(|row| {
                element! {
                    FileRowView(row: Some(row))
                }
            }))
            Text(content: format!("└ {}/{} files sent", sent, total))
        }
    }
}

#[derive(Default, Props)]
pub struct BatchSummaryProps {
    /// (local name, name stored by the provider)
    pub succeeded: Vec<(String, String)>,
    /// (local name, error)
    pub failed: Vec<(String, String)>,
    pub elapsed: String,
}

#[component]
pub fn BatchSummary(props: &BatchSummaryProps) -> impl Into<AnyElement<'static>> {
    let headline = if props.failed.is_empty() {
        format!(
            "All {} file(s) uploaded in {}",
            props.succeeded.len(),
            props.elapsed
        )
    } else {
        format!(
            "{} of {} file(s) could not be uploaded:",
            props.failed.len(),
            props.failed.len() + props.succeeded.len()
        )
    };
    let color = if props.failed.is_empty() {
        Color::Green
    } else {
        Color::Red
    };

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, color: color, content: headline)
            #(props.failed.iter().map(|(name, error)| {
                element! {
                    Text(color: Color::Red, content: format!("  ✗ {}: {}", name, error))
                }
            }))
            #(props.succeeded.iter().filter(|(local, stored)| local != stored).map(|(local, stored)| {
                element! {
                    Text(color: Color::Yellow, content: format!("  {} was stored as {}", local, stored))
                }
            }))
        }
    }
}

#[component]
pub fn ConfigHeader() -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, content: "dbxup configuration")
            Text(content: "Press enter to keep the value shown in brackets.")
        }
    }
}

#[derive(Default, Props)]
pub struct InputPromptProps {
    pub prompt: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

#[component]
pub fn InputPrompt(props: &InputPromptProps) -> impl Into<AnyElement<'static>> {
    let prompt = match &props.default {
        Some(default) => format!("{} [{}]", props.prompt, default),
        None => props.prompt.clone(),
    };

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, content: prompt)
            #(props.description.as_ref().map(|description| element! {
                Text(color: Color::DarkGrey, content: description.clone())
            }))
        }
    }
}

#[derive(Default, Props)]
pub struct MessageProps {
    pub message: String,
}

#[component]
pub fn ErrorMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        Text(color: Color::Red, content: format!("✗ {}", props.message))
    }
}

#[component]
pub fn SuccessMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        Text(color: Color::Green, content: format!("✓ {}", props.message))
    }
}
