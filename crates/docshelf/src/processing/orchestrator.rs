//! Runs the post-processing pipeline for stored documents
//!
//! Every outstanding action of a document runs concurrently; each outcome is
//! merged into the record as soon as it arrives, so a crash part-way through
//! only loses the actions that had not finished. Documents stay in the
//! pending set until every action is terminal, and [`Orchestrator::recover`]
//! reschedules whatever is left in it at startup.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::actions::{Action, ActionRegistry};
use crate::error::{Error, Result};
use crate::providers::SearchMirror;
use crate::storage::{DocumentRepository, PendingSet};
use crate::types::{ActionKind, ContentAddress, DocumentRecord};

/// Progress of one action within a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Applied,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Applied | ActionState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionStatus {
    pub action: ActionKind,
    pub state: ActionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latest pipeline run for a document, as shown by `GET /jobs/{address}`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub address: ContentAddress,
    pub actions: Vec<ActionStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineProgress {
    pub fn is_finished(&self) -> bool {
        self.actions.iter().all(|a| a.state.is_terminal())
    }

    pub fn state_of(&self, kind: ActionKind) -> Option<ActionState> {
        self.actions.iter().find(|a| a.action == kind).map(|a| a.state)
    }
}

/// Schedules and runs action pipelines
pub struct Orchestrator {
    repository: Arc<DocumentRepository>,
    pending: PendingSet,
    registry: Arc<ActionRegistry>,
    mirror: Arc<dyn SearchMirror>,
    board: DashMap<ContentAddress, PipelineProgress>,
    /// Finished runs still shown on the board, oldest first
    finished: Mutex<VecDeque<ContentAddress>>,
    board_history: usize,
    running: DashSet<ContentAddress>,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<DocumentRepository>,
        pending: PendingSet,
        registry: Arc<ActionRegistry>,
        mirror: Arc<dyn SearchMirror>,
        board_history: usize,
    ) -> Self {
        tracing::info!(
            "Orchestrator configured: actions [{}], last {} finished runs kept",
            registry
                .kinds()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            board_history
        );

        Self {
            repository,
            pending,
            registry,
            mirror,
            board: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            board_history,
            running: DashSet::new(),
        }
    }

    /// Start the pipeline in the background. Returns `None` if a pipeline
    /// for this address is already running.
    pub fn schedule(self: &Arc<Self>, address: ContentAddress) -> Option<JoinHandle<()>> {
        if !self.running.insert(address.clone()) {
            tracing::debug!("Pipeline for {} already running", address);
            return None;
        }

        let orchestrator = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = orchestrator.run(&address).await {
                tracing::error!("Pipeline for {} failed: {}", address, e);
            }
            orchestrator.running.remove(&address);
        }))
    }

    /// Reschedule every document left in the pending set
    pub fn recover(self: &Arc<Self>, batch_size: usize) -> Result<Vec<JoinHandle<()>>> {
        let pending = self.pending.all(batch_size)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!("Recovering {} pending documents", pending.len());
        Ok(pending
            .into_iter()
            .filter_map(|address| self.schedule(address))
            .collect())
    }

    pub fn is_running(&self, address: &ContentAddress) -> bool {
        self.running.contains(address)
    }

    /// Latest known progress for an address
    pub fn progress(&self, address: &ContentAddress) -> Option<PipelineProgress> {
        self.board.get(address).map(|p| p.value().clone())
    }

    /// Run every outstanding action of one document to completion
    pub async fn run(&self, address: &ContentAddress) -> Result<PipelineProgress> {
        let record = match self.repository.find(address).await? {
            Some(record) => record,
            None => {
                tracing::warn!("Pending document {} has no record, dropping it", address);
                self.pending.remove(address)?;
                self.repository.release(address);
                return Err(Error::not_found(format!("document {}", address)));
            }
        };

        let mut progress = PipelineProgress {
            address: address.clone(),
            actions: self
                .registry
                .actions()
                .iter()
                .map(|action| ActionStatus {
                    action: action.kind(),
                    state: if record.results.is_applied(action.kind()) {
                        ActionState::Applied
                    } else {
                        ActionState::Pending
                    },
                    error: None,
                })
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        };
        self.board.insert(address.clone(), progress.clone());

        let outstanding: Vec<_> = self
            .registry
            .actions()
            .iter()
            .filter(|action| !record.results.is_applied(action.kind()))
            .cloned()
            .collect();
        tracing::info!("Running {} actions for {}", outstanding.len(), address);

        let statuses = join_all(outstanding.iter().map(|action| self.run_action(action.as_ref(), address))).await;
        for status in statuses {
            if let Some(slot) = progress.actions.iter_mut().find(|a| a.action == status.action) {
                *slot = status;
            }
        }
        progress.finished_at = Some(Utc::now());
        self.board.insert(address.clone(), progress.clone());
        self.retire(address);

        if progress.is_finished() {
            self.pending.remove(address)?;
        }
        self.repository.release(address);

        let failed = progress
            .actions
            .iter()
            .filter(|a| a.state == ActionState::Failed)
            .count();
        if failed > 0 {
            tracing::warn!("Pipeline for {} finished with {} failed actions", address, failed);
        } else {
            tracing::info!("Pipeline for {} finished", address);
        }
        Ok(progress)
    }

    /// Remember a finished run, evicting the oldest finished ones past the
    /// history limit. Runs in progress are never evicted.
    fn retire(&self, address: &ContentAddress) {
        let mut finished = self.finished.lock();
        finished.retain(|a| a != address);
        finished.push_back(address.clone());
        while finished.len() > self.board_history {
            if let Some(oldest) = finished.pop_front() {
                self.board
                    .remove_if(&oldest, |_, progress| progress.finished_at.is_some());
            }
        }
    }

    fn set_state(&self, address: &ContentAddress, kind: ActionKind, state: ActionState) {
        if let Some(mut progress) = self.board.get_mut(address) {
            if let Some(slot) = progress.actions.iter_mut().find(|a| a.action == kind) {
                slot.state = state;
            }
        }
    }

    async fn run_action(&self, action: &dyn Action, address: &ContentAddress) -> ActionStatus {
        let kind = action.kind();
        self.set_state(address, kind, ActionState::Running);

        let status = match self.apply(action, address).await {
            Ok(()) => ActionStatus {
                action: kind,
                state: ActionState::Applied,
                error: None,
            },
            Err(e) => {
                tracing::error!("Action {} failed for {}: {}", kind, address, e);
                ActionStatus {
                    action: kind,
                    state: ActionState::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        self.set_state(address, kind, status.state);
        status
    }

    async fn apply(&self, action: &dyn Action, address: &ContentAddress) -> Result<()> {
        let kind = action.kind();
        let record = self.repository.get(address).await?;
        if record.results.is_applied(kind) {
            return Ok(());
        }

        let outcome = action.run(&record).await?;

        // Ordered with any concurrent delete of the same address.
        let mirror = &self.mirror;
        self.repository
            .update_and_publish(
                address,
                |record| record.results.merge(outcome),
                |record| async move { publish_to_mirror(mirror.as_ref(), &record).await },
            )
            .await?;
        Ok(())
    }
}

/// Upsert a live record into the mirror. Failures only log; the sidecar
/// stays authoritative.
pub(crate) async fn publish_to_mirror(mirror: &dyn SearchMirror, record: &DocumentRecord) {
    if record.deleted {
        return;
    }
    if let Err(e) = mirror.upsert(record).await {
        tracing::warn!("{} upsert for {} failed: {}", mirror.name(), record.address(), e);
    }
}
