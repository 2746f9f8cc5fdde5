//! Status vocabulary shared by every task type, and the pure functions that
//! derive phase and file status from stored task timestamps.
//!
//! Nothing here is persisted: status is always recomputed from the task row,
//! so two derivations over the same row agree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LibrarianError;
use crate::types::{ContentProcessingTask, ExtractionSubTask, text_enum};

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// State of one phase (extraction, embedding) or one extraction sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseStatus {
    None,
    Pending,
    Running,
    Finished,
    Failed,
    TimedOut,
    Cancelled,
    /// The task ended before this phase could start.
    Skipped,
}

text_enum!(PhaseStatus {
    None => "none",
    Pending => "pending",
    Running => "running",
    Finished => "finished",
    Failed => "failed",
    TimedOut => "timedOut",
    Cancelled => "cancelled",
    Skipped => "skipped",
});

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::TimedOut | Self::Cancelled | Self::Skipped
        )
    }
}

pub type ExtractionStatus = PhaseStatus;
pub type EmbeddingStatus = PhaseStatus;

/// Aggregate status of a processing task, and of the file it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessingStatus {
    None,
    Pending,
    Validating,
    ValidationFailed,
    Extracting,
    ExtractionFailed,
    ExtractionFinished,
    Embedding,
    EmbeddingFailed,
    EmbeddingFinished,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

text_enum!(ProcessingStatus {
    None => "none",
    Pending => "pending",
    Validating => "validating",
    ValidationFailed => "validationFailed",
    Extracting => "extracting",
    ExtractionFailed => "extractionFailed",
    ExtractionFinished => "extractionFinished",
    Embedding => "embedding",
    EmbeddingFailed => "embeddingFailed",
    EmbeddingFinished => "embeddingFinished",
    Completed => "completed",
    TimedOut => "timedOut",
    Cancelled => "cancelled",
    Failed => "failed",
});

impl ProcessingStatus {
    /// Failure states eligible for `retryFailed`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed
                | Self::ExtractionFailed
                | Self::EmbeddingFailed
                | Self::TimedOut
                | Self::Failed
        )
    }
}

/// Lifecycle of an enrichment task. Retries create a fresh task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

text_enum!(EnrichmentStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Canceled => "canceled",
});

impl EnrichmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

struct PhaseStamps {
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    failed: Option<DateTime<Utc>>,
    timed_out: bool,
}

fn phase_status(phase: PhaseStamps, cancelled: bool, task_ended: bool) -> PhaseStatus {
    if phase.timed_out {
        PhaseStatus::TimedOut
    } else if phase.finished.is_some() {
        PhaseStatus::Finished
    } else if cancelled && phase.started.is_some() {
        PhaseStatus::Cancelled
    } else if phase.failed.is_some() {
        PhaseStatus::Failed
    } else if task_ended {
        PhaseStatus::Skipped
    } else if phase.started.is_some() {
        PhaseStatus::Running
    } else {
        PhaseStatus::Pending
    }
}

impl ContentProcessingTask {
    pub fn extraction_status(&self) -> ExtractionStatus {
        phase_status(
            PhaseStamps {
                started: self.extraction_started_at,
                finished: self.extraction_finished_at,
                failed: self.extraction_failed_at,
                timed_out: self.extraction_timeout,
            },
            self.processing_cancelled,
            self.is_terminal(),
        )
    }

    pub fn embedding_status(&self) -> EmbeddingStatus {
        phase_status(
            PhaseStamps {
                started: self.embedding_started_at,
                finished: self.embedding_finished_at,
                failed: self.embedding_failed_at,
                timed_out: self.embedding_timeout,
            },
            self.processing_cancelled,
            self.is_terminal(),
        )
    }

    /// The most advanced phase reached, with terminal outcomes taking precedence.
    pub fn processing_status(&self) -> ProcessingStatus {
        if self.processing_cancelled {
            return ProcessingStatus::Cancelled;
        }
        if self.processing_timeout || self.extraction_timeout || self.embedding_timeout {
            return ProcessingStatus::TimedOut;
        }
        if self.embedding_failed_at.is_some() {
            return ProcessingStatus::EmbeddingFailed;
        }
        if self.extraction_failed_at.is_some() {
            return ProcessingStatus::ExtractionFailed;
        }
        if self.processing_failed_at.is_some() {
            return if self.extraction_started_at.is_none() {
                ProcessingStatus::ValidationFailed
            } else {
                ProcessingStatus::Failed
            };
        }
        if self.processing_finished_at.is_some() {
            return ProcessingStatus::Completed;
        }
        if self.embedding_finished_at.is_some() {
            return ProcessingStatus::EmbeddingFinished;
        }
        if self.embedding_started_at.is_some() {
            return ProcessingStatus::Embedding;
        }
        if self.extraction_finished_at.is_some() {
            return ProcessingStatus::ExtractionFinished;
        }
        if self.extraction_started_at.is_some() {
            return ProcessingStatus::Extracting;
        }
        if self.processing_started_at.is_some() {
            return ProcessingStatus::Validating;
        }
        ProcessingStatus::Pending
    }
}

impl ExtractionSubTask {
    /// Sub-task status; `cancelled` is the parent task's flag.
    pub fn status(&self, cancelled: bool) -> PhaseStatus {
        let ended = self.finished_at.is_some() || self.failed_at.is_some() || self.timed_out;
        phase_status(
            PhaseStamps {
                started: self.started_at,
                finished: self.finished_at,
                failed: self.failed_at,
                timed_out: self.timed_out,
            },
            cancelled && !ended,
            false,
        )
    }
}

/// Derive a file's status from its tasks: the latest non-cancelled task wins.
pub fn derive_file_status(tasks: &[ContentProcessingTask]) -> ProcessingStatus {
    tasks
        .iter()
        .filter(|t| !t.processing_cancelled)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .map(ContentProcessingTask::processing_status)
        .unwrap_or(ProcessingStatus::None)
}
