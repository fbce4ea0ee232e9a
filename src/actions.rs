use crate::{
    error::WorkerLost,
    item::{ItemId, PackageExtension},
    transfer::{copy_package, CopyOutcome, SkipReason},
};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt, fs, io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Copy,
    Delete,
}

impl ActionType {
    pub fn label(self) -> &'static str {
        match self {
            ActionType::Copy => "copy",
            ActionType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum ItemState {
    Indeterminate,
    Successful,
    Error(String),
}

impl ItemState {
    pub fn is_successful(&self) -> bool {
        matches!(self, ItemState::Successful)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Indeterminate => f.write_str("pending"),
            ItemState::Successful => f.write_str("ok"),
            ItemState::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionItem {
    pub id: ItemId,
    pub title: Option<String>,
    pub source: Option<PathBuf>,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub id: ItemId,
    pub action: ActionType,
    #[serde(flatten)]
    pub state: ItemState,
}

pub type ItemObserver = Arc<dyn Fn(&ActionOutcome) + Send + Sync>;
type FinishCallback = Box<dyn FnOnce(&BatchSummary) + Send>;

pub struct ActionBatch {
    action: ActionType,
    items: Vec<ActionItem>,
    observers: HashMap<ItemId, Vec<ItemObserver>>,
    on_finished: Option<FinishCallback>,
}

impl ActionBatch {
    pub fn new(action: ActionType, items: Vec<ActionItem>) -> Self {
        Self {
            action,
            items,
            observers: HashMap::new(),
            on_finished: None,
        }
    }

    /// Called on the worker thread as soon as `id` leaves `Indeterminate`.
    pub fn observe<F>(mut self, id: ItemId, observer: F) -> Self
    where
        F: Fn(&ActionOutcome) + Send + Sync + 'static,
    {
        self.observers.entry(id).or_default().push(Arc::new(observer));
        self
    }

    /// Called exactly once when the batch ends, however it ends.
    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&BatchSummary) + Send + 'static,
    {
        self.on_finished = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub action: ActionType,
    pub status: BatchStatus,
    /// In submission order. Items a crashed batch never reached are absent.
    pub outcomes: Vec<ActionOutcome>,
}

impl BatchSummary {
    pub fn successes(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.state.is_successful())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.state.is_successful())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Item(ActionOutcome),
    Progress(f64),
    Finished(BatchSummary),
}

#[derive(Clone)]
pub struct ActionExecutor {
    pool: Arc<rayon::ThreadPool>,
    extension: PackageExtension,
}

impl ActionExecutor {
    pub fn new(
        max_parallel: usize,
        extension: PackageExtension,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_parallel.max(1))
            .thread_name(|index| format!("modsync-action-{index}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
            extension,
        })
    }

    pub fn submit(&self, batch: ActionBatch) -> BatchHandle {
        let (tx, rx) = mpsc::channel();
        let pool = Arc::clone(&self.pool);
        let extension = self.extension.clone();
        let worker = thread::Builder::new()
            .name(format!("modsync-{}", batch.action.label()))
            .spawn(move || run_batch(&pool, &extension, batch, tx));
        match worker {
            Ok(worker) => BatchHandle {
                events: rx,
                worker: Some(worker),
            },
            Err(err) => {
                error!(error = %err, "could not start action worker");
                BatchHandle {
                    events: rx,
                    worker: None,
                }
            }
        }
    }
}

struct Progress {
    done: usize,
    total: usize,
}

fn run_batch(
    pool: &rayon::ThreadPool,
    ext: &PackageExtension,
    batch: ActionBatch,
    tx: Sender<BatchEvent>,
) {
    let ActionBatch {
        action,
        items,
        observers,
        on_finished,
    } = batch;
    let total = items.len();
    info!(action = action.label(), items = total, "action batch started");

    let slots: Mutex<Vec<Option<ActionOutcome>>> = Mutex::new(vec![None; total]);
    // Increment and publish under one lock so observers never see progress
    // go backwards.
    let progress = Mutex::new(Progress { done: 0, total });

    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            items.par_iter().enumerate().for_each(|(index, item)| {
                let state = execute(action, item, ext);
                let outcome = ActionOutcome {
                    id: item.id,
                    action,
                    state,
                };
                if let Some(list) = observers.get(&item.id) {
                    for observer in list {
                        observer(&outcome);
                    }
                }
                let _ = tx.send(BatchEvent::Item(outcome.clone()));
                slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(outcome);

                let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
                progress.done += 1;
                let value = if progress.done >= progress.total {
                    1.0
                } else {
                    progress.done as f64 / progress.total as f64
                };
                let _ = tx.send(BatchEvent::Progress(value));
            });
        })
    }));

    let status = match run {
        Ok(()) => BatchStatus::Completed,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(action = action.label(), %reason, "action batch aborted");
            BatchStatus::Aborted(reason)
        }
    };
    if total == 0 {
        let _ = tx.send(BatchEvent::Progress(1.0));
    }
    let outcomes: Vec<ActionOutcome> = slots
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .flatten()
        .collect();
    let summary = BatchSummary {
        action,
        status,
        outcomes,
    };
    info!(
        action = action.label(),
        succeeded = summary.successes().count(),
        failed = summary.failures().count(),
        "action batch finished"
    );
    if let Some(callback) = on_finished {
        callback(&summary);
    }
    let _ = tx.send(BatchEvent::Finished(summary));
}

fn execute(action: ActionType, item: &ActionItem, ext: &PackageExtension) -> ItemState {
    let result = match action {
        ActionType::Copy => copy_item(item, ext),
        ActionType::Delete => delete_item(item),
    };
    match result {
        Ok(()) => {
            debug!(id = %item.id, action = action.label(), "item done");
            ItemState::Successful
        }
        Err(cause) => {
            warn!(id = %item.id, action = action.label(), %cause, "item failed");
            ItemState::Error(cause)
        }
    }
}

fn copy_item(item: &ActionItem, ext: &PackageExtension) -> Result<(), String> {
    let source = item
        .source
        .as_deref()
        .ok_or_else(|| "no workshop copy to install".to_string())?;
    match copy_package(source, &item.target, ext) {
        Ok(CopyOutcome::Copied) => Ok(()),
        Ok(CopyOutcome::Skipped(reason)) => Err(skip_cause(reason).to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn delete_item(item: &ActionItem) -> Result<(), String> {
    match fs::remove_file(&item.target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err("not installed".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn skip_cause(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::SourceMissing => "workshop file is missing",
        SkipReason::SourceNotAFile => "workshop entry is not a file",
        SkipReason::WrongTargetExtension => "target path has the wrong extension",
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "worker panicked".to_string()
}

pub struct BatchHandle {
    events: Receiver<BatchEvent>,
    worker: Option<JoinHandle<()>>,
}

impl BatchHandle {
    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    pub fn join(self) -> Result<BatchSummary, WorkerLost> {
        self.join_with(|_| {})
    }

    pub fn join_with<F>(self, mut on_event: F) -> Result<BatchSummary, WorkerLost>
    where
        F: FnMut(&BatchEvent),
    {
        let mut finished = None;
        for event in self.events.iter() {
            on_event(&event);
            if let BatchEvent::Finished(summary) = event {
                finished = Some(summary);
                break;
            }
        }
        if let Some(worker) = self.worker {
            let _ = worker.join();
        }
        finished.ok_or(WorkerLost)
    }
}
