//! Follow a remote agent task from the terminal: stream its messages or poll its trace.

use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;

use clap::{Parser, Subcommand};
use taskwatch_core::prelude::*;
use taskwatch_core::{
    EntryFamily, EntryKey, MessageEntry, SpanId, SpanNode, SupervisorExit, init_observability,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taskwatch")]
#[command(about = "Follow a remote agent task's messages and trace")]
struct Cli {
    /// Backend base URL; overrides TASKWATCH_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Bearer token; overrides TASKWATCH_API_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a task's messages until it completes.
    Stream { task_id: String },
    /// Poll a task's trace spans and print the span tree when it changes.
    Trace {
        task_id: String,
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Span to keep selected across refreshes.
        #[arg(long)]
        select: Option<String>,
        /// Fetch once, print, and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    let mut config = match cli.base_url.as_deref() {
        Some(base_url) => TaskwatchConfig::from_lookup(|key| match key {
            "TASKWATCH_BASE_URL" => Some(base_url.to_string()),
            other => std::env::var(other).ok(),
        })?,
        None => TaskwatchConfig::from_env()?,
    };
    if let Some(token) = cli.token {
        config.api.api_token = Some(token);
    }

    match cli.command {
        Command::Stream { task_id } => stream(config, TaskId::new(task_id)).await,
        Command::Trace {
            task_id,
            interval_ms,
            select,
            once,
        } => {
            if let Some(interval_ms) = interval_ms {
                config.trace.interval = Duration::from_millis(interval_ms);
            }
            trace(config, TaskId::new(task_id), select.map(SpanId::new), once).await
        }
    }
}

async fn stream(config: TaskwatchConfig, task_id: TaskId) -> Result<(), Box<dyn std::error::Error>> {
    let client = Taskwatch::new(config)?;
    let (handler, mut notices) = ChannelHandler::new();
    let supervised = client.supervise(task_id.clone(), handler);
    let mut reconciler = MessageReconciler::new();
    let mut printer = MessagePrinter::default();

    loop {
        let notice = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(task_id = %task_id, "interrupted");
                break;
            }
            notice = notices.recv() => notice,
        };
        match notice {
            Some(StreamNotice::Event { event, .. }) => match reconciler.apply(event) {
                Applied::Created(key) | Applied::Updated(key) => {
                    if let Some(entry) = reconciler.store().get(&key) {
                        printer.show(&key, entry)?;
                    }
                }
                Applied::Unchanged(_) | Applied::Completed => {}
                Applied::Failed(message) => eprintln!("\n[task error] {message}"),
            },
            Some(StreamNotice::Error { error, .. }) => eprintln!("\n[stream] {error}"),
            Some(StreamNotice::Connected { .. }) => {}
            Some(StreamNotice::Completed { .. }) | None => break,
        }
    }

    supervised.stop();
    let exit = supervised.wait().await;
    println!();
    println!(
        "{} message(s) received for task {task_id}",
        reconciler.store().len()
    );
    match exit {
        SupervisorExit::Exhausted { attempts } => {
            Err(format!("gave up after {attempts} reconnect attempt(s)").into())
        }
        _ => Ok(()),
    }
}

/// Prints streamed text incrementally and tool calls as single lines.
#[derive(Default)]
struct MessagePrinter {
    current: Option<EntryKey>,
    printed: HashMap<EntryKey, usize>,
}

impl MessagePrinter {
    fn show(&mut self, key: &EntryKey, entry: &MessageEntry) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        if key.family == EntryFamily::Tool {
            let tool = entry.tool.as_ref();
            match tool.and_then(|t| t.response.as_ref()) {
                Some(response) => writeln!(
                    out,
                    "\n[tool] {} -> {response}",
                    tool.map(|t| t.name.as_str()).unwrap_or("?")
                )?,
                None => writeln!(out, "\n[tool] {}", entry.content)?,
            }
            self.current = None;
            return out.flush();
        }

        let already = self.printed.get(key).copied().unwrap_or(0);
        let appended = entry.content.len() >= already && entry.content.is_char_boundary(already);
        if self.current.as_ref() != Some(key) || !appended {
            write!(out, "\n{:?}: ", entry.author)?;
            write!(out, "{}", entry.content)?;
        } else {
            write!(out, "{}", &entry.content[already..])?;
        }
        self.printed.insert(key.clone(), entry.content.len());
        self.current = Some(key.clone());
        out.flush()
    }
}

async fn trace(
    config: TaskwatchConfig,
    task_id: TaskId,
    select: Option<SpanId>,
    once: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Taskwatch::new(config)?;
    let poller = client.trace_poller();
    let mut updates = poller.updates();
    let mut snapshots = poller.subscribe();
    let handle = poller.start(task_id.clone());

    let first = first_snapshot(poller, &mut snapshots, select).await?;
    print!("{}", render_snapshot(&first));
    if once {
        handle.stop();
        return Ok(());
    }

    loop {
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => update,
        };
        match update {
            Ok(TraceUpdate::CountChanged { .. }) => {
                print!("{}", render_snapshot(&poller.snapshot()));
            }
            Ok(TraceUpdate::SelectionCleared { span_id }) => {
                println!("selected span {span_id} is gone");
            }
            Ok(TraceUpdate::FetchFailed { error }) => eprintln!("[trace] {error}"),
            Err(RecvError::Lagged(skipped)) => info!(skipped, "trace updates lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    handle.stop();
    Ok(())
}

/// Waits for the first completed fetch, then applies the requested selection.
async fn first_snapshot(
    poller: &TracePoller,
    snapshots: &mut watch::Receiver<SpanSnapshot>,
    select: Option<SpanId>,
) -> Result<SpanSnapshot, watch::error::RecvError> {
    snapshots
        .wait_for(|snapshot| snapshot.fetched_at.is_some())
        .await?;
    if let Some(span_id) = select
        && !poller.select_span(Some(span_id.clone()))
    {
        eprintln!("span {span_id} not found in trace");
    }
    // Read after selecting so the tree marks the selection.
    Ok(poller.snapshot())
}

fn render_snapshot(snapshot: &SpanSnapshot) -> String {
    let trace_id = snapshot
        .trace_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let mut out = format!("trace {trace_id}: {} span(s)\n", snapshot.spans.len());
    if let Some(error) = &snapshot.last_error {
        out.push_str(&format!("  last fetch failed: {error}\n"));
    }
    let selected = snapshot.selected.as_ref().map(|span| &span.id);
    for root in snapshot.tree() {
        render_node(&mut out, &root, 1, selected);
    }
    out
}

fn render_node(out: &mut String, node: &SpanNode, depth: usize, selected: Option<&SpanId>) {
    let marker = if selected == Some(&node.span.id) { '*' } else { ' ' };
    let timing = match node.span.duration() {
        Some(duration) => format!("{}ms", duration.num_milliseconds()),
        None => "running".to_string(),
    };
    out.push_str(&format!(
        "{marker}{:indent$}{} [{}] {timing}\n",
        "",
        node.span.name,
        node.span.id,
        indent = depth * 2
    ));
    for child in &node.children {
        render_node(out, child, depth + 1, selected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwatch_core::{FetchError, Span, TaskInfo, TraceApi, TraceId, TracePollerConfig};

    struct FixedTrace;

    #[async_trait::async_trait]
    impl TraceApi for FixedTrace {
        async fn fetch_task(&self, _task_id: &TaskId) -> Result<TaskInfo, FetchError> {
            Ok(TaskInfo::default())
        }

        async fn fetch_spans(
            &self,
            _task_id: &TaskId,
            _trace_id: &TraceId,
        ) -> Result<Vec<Span>, FetchError> {
            let spans = serde_json::json!([
                {"id": "root", "traceId": "t1", "name": "run", "startTime": "2024-05-01T10:00:00Z"},
                {"id": "llm", "traceId": "t1", "parentId": "root", "name": "llm.call",
                 "startTime": "2024-05-01T10:00:01Z", "endTime": "2024-05-01T10:00:02Z"},
            ]);
            serde_json::from_value(spans).map_err(|e| FetchError::Decode(e.to_string()))
        }
    }

    #[tokio::test]
    async fn first_snapshot_marks_requested_selection() {
        let poller = TracePoller::new(std::sync::Arc::new(FixedTrace), TracePollerConfig::default());
        let mut snapshots = poller.subscribe();
        let handle = poller.start(TaskId::new("t1"));

        let first = first_snapshot(&poller, &mut snapshots, Some(SpanId::new("llm")))
            .await
            .expect("first snapshot");
        handle.stop();

        assert_eq!(first.selected.as_ref().map(|s| s.id.as_str()), Some("llm"));
        let rendered = render_snapshot(&first);
        assert!(rendered.starts_with("trace t1: 2 span(s)\n"));
        assert!(rendered.contains("*    llm.call [llm] 1000ms"));
        assert!(rendered.contains("   run [root] running"));
    }
}
