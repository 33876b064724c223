//! Realtime filesystem watcher.
//!
//! The platform watcher publishes from its own thread into a bounded queue;
//! one cooperative consumer normalizes, filters, debounces, and feeds the
//! indexing coordinator. Search never waits on indexing: every processed
//! file is followed by a storage flush so readers see the change
//! immediately.
//!
//! Ordering: events for a given path are handled in arrival order. No
//! cross-path ordering is promised.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::IndexingConfig;
use crate::embedding::EmbeddingService;
use crate::indexing::IndexingCoordinator;

/// Bounded handoff between the platform watcher thread and the consumer.
const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Coalescing window for modify events.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Longest the platform thread will wait on a full queue before dropping.
const PRODUCER_MAX_WAIT: Duration = Duration::from_secs(1);

/// Fallback extension set when no include patterns are configured.
const DEFAULT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "java", "cpp", "c", "h", "hpp", "cs", "go", "rs", "rb",
    "php", "swift", "kt", "scala", "md", "txt",
];

/// Normalized filesystem event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

/// Processing priority. Initial-scan work skips embeddings for throughput
/// and is re-enqueued at `Embed` priority once indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Initial,
    Change,
    Embed,
}

/// Watcher statistics snapshot.
#[derive(Debug, Clone)]
pub struct WatcherStats {
    pub pending_files: usize,
    pub failed_files: usize,
    pub watching: PathBuf,
}

/// Include/exclude decision for watcher events.
struct EventFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl EventFilter {
    fn from_config(config: &IndexingConfig) -> Self {
        Self {
            include: build_globset(&config.include),
            exclude: build_globset(&config.exclude),
        }
    }

    fn should_index(&self, path: &Path) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path) {
                return false;
            }
            if let Some(name) = path.file_name() {
                if exclude.is_match(Path::new(name)) {
                    return false;
                }
            }
        }
        match &self.include {
            Some(include) => {
                include.is_match(path)
                    || path
                        .file_name()
                        .map(|n| include.is_match(Path::new(n)))
                        .unwrap_or(false)
            }
            None => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| DEFAULT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false),
        }
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().ok()
}

/// Classify a raw notify event into normalized events, applying the
/// atomic-rename rules: temp→indexable is a create, indexable→indexable is
/// delete+create, indexable→temp is a delete.
fn normalize_event(event: &notify::Event, filter: &EventFilter) -> Vec<FileEvent> {
    let mut out = Vec::new();
    match &event.kind {
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let src = &event.paths[0];
            let dst = &event.paths[1];
            let src_ok = filter.should_index(src);
            let dst_ok = filter.should_index(dst);
            if !src_ok && dst_ok {
                out.push(FileEvent {
                    kind: FileEventKind::Created,
                    path: dst.clone(),
                });
            } else if src_ok && dst_ok {
                out.push(FileEvent {
                    kind: FileEventKind::Deleted,
                    path: src.clone(),
                });
                out.push(FileEvent {
                    kind: FileEventKind::Created,
                    path: dst.clone(),
                });
            } else if src_ok {
                out.push(FileEvent {
                    kind: FileEventKind::Deleted,
                    path: src.clone(),
                });
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                if filter.should_index(path) {
                    out.push(FileEvent {
                        kind: FileEventKind::Deleted,
                        path: path.clone(),
                    });
                }
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) | NotifyKind::Create(_) => {
            for path in &event.paths {
                if filter.should_index(path) {
                    out.push(FileEvent {
                        kind: FileEventKind::Created,
                        path: path.clone(),
                    });
                }
            }
        }
        NotifyKind::Modify(_) => {
            for path in &event.paths {
                if filter.should_index(path) {
                    out.push(FileEvent {
                        kind: FileEventKind::Modified,
                        path: path.clone(),
                    });
                }
            }
        }
        NotifyKind::Remove(_) => {
            for path in &event.paths {
                if filter.should_index(path) {
                    out.push(FileEvent {
                        kind: FileEventKind::Deleted,
                        path: path.clone(),
                    });
                }
            }
        }
        _ => {}
    }
    out
}

struct Shared {
    /// Paths queued for processing (in-flight dedup).
    pending: Mutex<HashSet<PathBuf>>,
    /// Last-modify timestamps for the debounce window.
    debounce: Mutex<HashMap<PathBuf, Instant>>,
    /// Paths whose processing failed (kept for diagnostics).
    failed: Mutex<HashSet<String>>,
}

/// Watches a root directory and keeps the index current.
pub struct RealtimeWatcher {
    cancel: CancellationToken,
    consumer: Option<tokio::task::JoinHandle<()>>,
    processor: Option<tokio::task::JoinHandle<()>>,
    // Held to keep the platform watcher thread alive; dropped on stop.
    platform: Option<RecommendedWatcher>,
    shared: Arc<Shared>,
    work_tx: mpsc::UnboundedSender<(Priority, PathBuf)>,
    root: PathBuf,
}

impl RealtimeWatcher {
    /// Start watching `root`. The initial full scan is the coordinator's
    /// job (`process_directory`); the watcher handles live changes only.
    pub fn start(
        root: &Path,
        coordinator: Arc<IndexingCoordinator>,
        embedding_service: Option<Arc<EmbeddingService>>,
        config: &IndexingConfig,
    ) -> Result<Self, crate::Error> {
        // Canonicalize so event paths match the paths stored by the
        // coordinator (which canonicalizes before persisting).
        let root = &dunce::canonicalize(root)?;
        let filter = Arc::new(EventFilter::from_config(config));
        let (event_tx, event_rx) = mpsc::channel::<FileEvent>(EVENT_QUEUE_CAPACITY);
        let (work_tx, work_rx) = mpsc::unbounded_channel::<(Priority, PathBuf)>();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashSet::new()),
            debounce: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        });

        // Platform thread → bounded queue. try_send with a bounded wait so
        // the producer never blocks past PRODUCER_MAX_WAIT; overflow drops
        // are logged.
        let handler_filter = Arc::clone(&filter);
        let mut platform = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Watch error");
                        return;
                    }
                };
                for normalized in normalize_event(&event, &handler_filter) {
                    let mut waited = Duration::ZERO;
                    let mut item = normalized;
                    loop {
                        match event_tx.try_send(item) {
                            Ok(()) => break,
                            Err(mpsc::error::TrySendError::Full(back)) => {
                                if waited >= PRODUCER_MAX_WAIT {
                                    tracing::warn!(path = %back.path.display(), "Event queue full, dropping event");
                                    break;
                                }
                                std::thread::sleep(Duration::from_millis(10));
                                waited += Duration::from_millis(10);
                                item = back;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        platform
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;

        let consumer = tokio::spawn(consume_events(
            event_rx,
            work_tx.clone(),
            Arc::clone(&shared),
            Arc::clone(&coordinator),
            cancel.clone(),
        ));
        let processor = tokio::spawn(process_loop(
            work_rx,
            work_tx.clone(),
            Arc::clone(&shared),
            coordinator,
            embedding_service,
            cancel.clone(),
        ));

        tracing::info!(root = %root.display(), "Realtime watcher started");
        Ok(Self {
            cancel,
            consumer: Some(consumer),
            processor: Some(processor),
            platform: Some(platform),
            shared,
            work_tx,
            root: root.to_path_buf(),
        })
    }

    /// Enqueue paths from the startup scan at `Initial` priority (index
    /// without embeddings, then re-enqueue for embedding).
    pub fn enqueue_initial(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            if pending.insert(path.clone()) {
                let _ = self.work_tx.send((Priority::Initial, path));
            }
        }
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            pending_files: self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            failed_files: self
                .shared
                .failed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            watching: self.root.clone(),
        }
    }

    /// Cancel the consumer tasks and join the platform watcher. Queued
    /// events are discarded; in-flight processing finishes first.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        // Dropping the platform watcher joins its thread and closes the
        // event channel.
        self.platform.take();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.processor.take() {
            let _ = handle.await;
        }
        tracing::info!(root = %self.root.display(), "Realtime watcher stopped");
    }
}

/// Bridge: normalized events → debounced work items.
async fn consume_events(
    mut event_rx: mpsc::Receiver<FileEvent>,
    work_tx: mpsc::UnboundedSender<(Priority, PathBuf)>,
    shared: Arc<Shared>,
    coordinator: Arc<IndexingCoordinator>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event.kind {
            FileEventKind::Deleted => {
                // Deletions apply immediately; no debounce.
                let path_str = event.path.to_string_lossy().replace('\\', "/");
                if let Err(e) = coordinator.store().delete_file_completely(&path_str).await {
                    tracing::warn!(path = %path_str, error = %e, "Failed to remove deleted file");
                }
            }
            FileEventKind::Created => {
                enqueue(&shared, &work_tx, Priority::Change, event.path);
            }
            FileEventKind::Modified => {
                // Debounce: remember the latest modify and fire only after
                // the window passes without another one.
                let already_waiting = {
                    let mut debounce =
                        shared.debounce.lock().unwrap_or_else(|e| e.into_inner());
                    let was = debounce.contains_key(&event.path);
                    debounce.insert(event.path.clone(), Instant::now());
                    was
                };
                if already_waiting {
                    continue;
                }
                let shared = Arc::clone(&shared);
                let work_tx = work_tx.clone();
                let path = event.path.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(DEBOUNCE_WINDOW).await;
                        let quiesced = {
                            let debounce =
                                shared.debounce.lock().unwrap_or_else(|e| e.into_inner());
                            debounce
                                .get(&path)
                                .map(|last| last.elapsed() >= DEBOUNCE_WINDOW)
                                .unwrap_or(true)
                        };
                        if quiesced {
                            shared
                                .debounce
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .remove(&path);
                            enqueue(&shared, &work_tx, Priority::Change, path);
                            break;
                        }
                    }
                });
            }
        }
    }
}

fn enqueue(
    shared: &Arc<Shared>,
    work_tx: &mpsc::UnboundedSender<(Priority, PathBuf)>,
    priority: Priority,
    path: PathBuf,
) {
    let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
    // A path already queued is not re-queued.
    if pending.insert(path.clone()) {
        let _ = work_tx.send((priority, path));
    }
}

/// Single-worker processing loop. Operations may suspend on I/O but the
/// loop itself never blocks the runtime.
async fn process_loop(
    mut work_rx: mpsc::UnboundedReceiver<(Priority, PathBuf)>,
    work_tx: mpsc::UnboundedSender<(Priority, PathBuf)>,
    shared: Arc<Shared>,
    coordinator: Arc<IndexingCoordinator>,
    embedding_service: Option<Arc<EmbeddingService>>,
    cancel: CancellationToken,
) {
    loop {
        let (priority, path) = tokio::select! {
            _ = cancel.cancelled() => break,
            item = work_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);

        // The file may have been deleted while queued.
        if tokio::fs::metadata(&path).await.is_err() {
            tracing::debug!(path = %path.display(), "Skipping queued file that no longer exists");
            continue;
        }

        match priority {
            Priority::Embed => {
                // Second pass for initial-scan files: fill in embeddings.
                if let Some(service) = &embedding_service {
                    if let Err(e) = embed_file(&coordinator, service, &path).await {
                        tracing::warn!(path = %path.display(), error = %e, "Embed pass failed");
                        shared
                            .failed
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(path.to_string_lossy().into_owned());
                    }
                }
            }
            Priority::Initial | Priority::Change => {
                let skip_embeddings = priority == Priority::Initial;
                let result = coordinator.process_file(&path, skip_embeddings).await;
                match result.status {
                    crate::indexing::ProcessStatus::Error => {
                        shared
                            .failed
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(path.to_string_lossy().into_owned());
                    }
                    _ => {
                        // Flush so the change is immediately visible to
                        // readers.
                        if let Err(e) = coordinator.store().flush().await {
                            tracing::debug!(error = %e, "Post-process flush failed");
                        }
                        if skip_embeddings {
                            enqueue(&shared, &work_tx, Priority::Embed, path);
                        }
                    }
                }
            }
        }
    }
}

async fn embed_file(
    coordinator: &Arc<IndexingCoordinator>,
    service: &Arc<EmbeddingService>,
    path: &Path,
) -> Result<(), crate::Error> {
    let path_str = dunce::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/");
    let Some(file) = coordinator.store().get_file_by_path(&path_str).await? else {
        return Ok(());
    };
    let chunk_ids: Vec<i64> = coordinator
        .store()
        .get_chunks_by_file_id(file.id)
        .await?
        .iter()
        .map(|c| c.id)
        .collect();
    service.embed_chunks(&chunk_ids).await?;
    Ok(())
}
