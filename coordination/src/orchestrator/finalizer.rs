//! Optional LLM pass that rewrites the final report into a clean,
//! operator-facing form with next-step instructions.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::prompts::{finalizer_user, FINALIZER_SYSTEM};
use super::report::FinalReport;
use crate::completion::{parse_json_object, ChatMessage, CompletionError, CompletionService};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("finalizer returned invalid JSON: {0}")]
    InvalidJson(String),

    #[error("finalizer output missing {0}")]
    MissingField(&'static str),
}

pub struct ReportFinalizer {
    completion: Arc<dyn CompletionService>,
}

impl ReportFinalizer {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    /// Ask the LLM for a clean version of `report`.
    ///
    /// Fields the model drops are back-filled from the input; an output
    /// without a summary or instructions is rejected.
    pub async fn finalize(&self, report: &FinalReport) -> Result<FinalReport, FinalizeError> {
        let input = serde_json::to_string_pretty(report)
            .map_err(|e| FinalizeError::InvalidJson(e.to_string()))?;
        let messages = [
            ChatMessage::system(FINALIZER_SYSTEM),
            ChatMessage::user(finalizer_user(&input)),
        ];
        let reply = self.completion.complete(&messages, &[]).await?;

        let obj = parse_json_object(&reply.content).map_err(FinalizeError::InvalidJson)?;
        let mut out: FinalReport = serde_json::from_value(Value::Object(obj))
            .map_err(|e| FinalizeError::InvalidJson(e.to_string()))?;
        out.finished = true;
        out.backfill_from(report);
        out.sanitize();

        if out.summary.is_none() {
            return Err(FinalizeError::MissingField("summary"));
        }
        if out.instructions.is_none() {
            return Err(FinalizeError::MissingField("instructions"));
        }
        Ok(out)
    }

    /// [`finalize`](Self::finalize), keeping the input report on any failure.
    pub async fn finalize_or_keep(&self, report: FinalReport) -> FinalReport {
        match self.finalize(&report).await {
            Ok(finalized) => {
                info!(status = %finalized.status(), "Final report finalized");
                finalized
            }
            Err(err) => {
                warn!(error = %err, "Report finalizer failed; keeping original report");
                report
            }
        }
    }
}
