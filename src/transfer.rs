use crate::{error::WorkerLost, item::PackageExtension};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
    thread::{self, JoinHandle},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl TransferJob {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Skipped jobs stay `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFault {
    pub target: PathBuf,
    pub kind: io::ErrorKind,
    pub message: String,
}

/// Outcome of a batch. Skipped jobs appear in neither map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub completed: Vec<PathBuf>,
    pub faults: BTreeMap<PathBuf, TransferFault>,
}

impl TransferReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Job { index: usize, state: JobState },
    Progress(f64),
    Finished(TransferReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SourceMissing,
    SourceNotAFile,
    WrongTargetExtension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    Skipped(SkipReason),
}

/// Why `source` cannot be installed at `target`, if it cannot. A skip is
/// policy, not an error.
pub fn check_package(source: &Path, target: &Path, ext: &PackageExtension) -> Option<SkipReason> {
    match fs::metadata(source) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Some(SkipReason::SourceNotAFile),
        Err(_) => return Some(SkipReason::SourceMissing),
    }
    if !ext.matches(target) {
        return Some(SkipReason::WrongTargetExtension);
    }
    None
}

pub fn copy_package(source: &Path, target: &Path, ext: &PackageExtension) -> io::Result<CopyOutcome> {
    if let Some(reason) = check_package(source, target, ext) {
        return Ok(CopyOutcome::Skipped(reason));
    }
    replace_package(source, target)?;
    Ok(CopyOutcome::Copied)
}

fn replace_package(source: &Path, target: &Path) -> io::Result<()> {
    remove_if_present(target)?;
    if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

pub fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    extension: PackageExtension,
}

impl TransferEngine {
    pub fn new(extension: PackageExtension) -> Self {
        Self { extension }
    }

    pub fn transfer(&self, jobs: Vec<TransferJob>) -> TransferHandle {
        let (tx, rx) = mpsc::channel();
        if jobs.is_empty() {
            let _ = tx.send(TransferEvent::Progress(1.0));
            let _ = tx.send(TransferEvent::Finished(TransferReport::default()));
            return TransferHandle {
                events: rx,
                worker: None,
            };
        }

        let extension = self.extension.clone();
        let worker = thread::Builder::new()
            .name("modsync-transfer".to_string())
            .spawn(move || run_batch(&jobs, &extension, &tx));
        match worker {
            Ok(worker) => TransferHandle {
                events: rx,
                worker: Some(worker),
            },
            Err(err) => {
                // No thread, no events: the handle reports the lost worker.
                warn!(error = %err, "could not start transfer worker");
                TransferHandle {
                    events: rx,
                    worker: None,
                }
            }
        }
    }
}

fn run_batch(jobs: &[TransferJob], ext: &PackageExtension, tx: &Sender<TransferEvent>) {
    let total = jobs.len();
    let mut report = TransferReport::default();
    info!(jobs = total, "transfer started");

    for index in 0..total {
        let _ = tx.send(TransferEvent::Job {
            index,
            state: JobState::Pending,
        });
    }

    for (index, job) in jobs.iter().enumerate() {
        if let Some(reason) = check_package(&job.source, &job.target, ext) {
            debug!(source = %job.source.display(), ?reason, "transfer job skipped");
        } else {
            let _ = tx.send(TransferEvent::Job {
                index,
                state: JobState::InProgress,
            });
            match replace_package(&job.source, &job.target) {
                Ok(()) => {
                    let _ = tx.send(TransferEvent::Job {
                        index,
                        state: JobState::Completed,
                    });
                    debug!(source = %job.source.display(), target = %job.target.display(), "copied");
                    report.completed.push(job.source.clone());
                }
                Err(err) => {
                    let _ = tx.send(TransferEvent::Job {
                        index,
                        state: JobState::Failed,
                    });
                    warn!(source = %job.source.display(), error = %err, "copy failed");
                    report.faults.insert(
                        job.source.clone(),
                        TransferFault {
                            target: job.target.clone(),
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }

        let progress = if index + 1 == total {
            1.0
        } else {
            (index + 1) as f64 / total as f64
        };
        let _ = tx.send(TransferEvent::Progress(progress));
    }

    info!(
        completed = report.completed.len(),
        faults = report.faults.len(),
        "transfer finished"
    );
    let _ = tx.send(TransferEvent::Finished(report));
}

pub struct TransferHandle {
    events: Receiver<TransferEvent>,
    worker: Option<JoinHandle<()>>,
}

impl TransferHandle {
    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events
    }

    pub fn join(self) -> Result<TransferReport, WorkerLost> {
        self.join_with_progress(|_| {})
    }

    pub fn join_with_progress<F>(self, mut on_progress: F) -> Result<TransferReport, WorkerLost>
    where
        F: FnMut(f64),
    {
        let mut finished = None;
        for event in self.events.iter() {
            match event {
                TransferEvent::Progress(value) => on_progress(value),
                TransferEvent::Finished(report) => {
                    finished = Some(report);
                    break;
                }
                TransferEvent::Job { .. } => {}
            }
        }
        if let Some(worker) = self.worker {
            let _ = worker.join();
        }
        finished.ok_or(WorkerLost)
    }
}
