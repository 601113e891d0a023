//! Update processing seam
//!
//! Content handlers live outside this crate. The agent hands every accepted
//! deployment document to an [`UpdateProcessor`] and queues whatever result
//! report it returns.

use crate::clock::SharedClock;
use crate::protocol::{UpdateResponse, UpdateResultReport};
use crate::workqueue::WorkItem;
use thiserror::Error;
use tracing::{debug, info};

/// Result code of a deployment accepted for processing
pub const RESULT_SUCCESS: i32 = 1;
pub const RESULT_FAILURE: i32 = 0;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("deployment document is not valid JSON: {0}")]
    InvalidDocument(#[from] serde_json::Error),
    #[error("update handler failed: {0}")]
    Handler(String),
}

/// Consumer of the update work queue
pub trait UpdateProcessor: Send {
    /// Process one deployment document. `Ok(None)` means there is nothing to
    /// report (no workflow, or one that was already handled).
    fn process(&mut self, item: &WorkItem) -> Result<Option<UpdateResultReport>, ProcessError>;
}

/// Processor that logs each new workflow and reports it as accepted
pub struct LoggingUpdateProcessor {
    clock: SharedClock,
    last_workflow_id: Option<String>,
}

impl LoggingUpdateProcessor {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            last_workflow_id: None,
        }
    }
}

impl UpdateProcessor for LoggingUpdateProcessor {
    #[tracing::instrument(name = "process_update", skip(self, item))]
    fn process(&mut self, item: &WorkItem) -> Result<Option<UpdateResultReport>, ProcessError> {
        let document: UpdateResponse = serde_json::from_str(&item.payload)?;
        let Some(workflow) = document.workflow else {
            debug!("Deployment document has no workflow, nothing to do");
            return Ok(None);
        };

        if self.last_workflow_id.as_deref() == Some(workflow.id.as_str()) {
            debug!(workflow_id = %workflow.id, "Workflow already handled");
            return Ok(None);
        }

        info!(
            workflow_id = %workflow.id,
            action = ?workflow.action,
            queued_at = %item.time_added,
            "Accepted deployment"
        );
        self.last_workflow_id = Some(workflow.id.clone());

        Ok(Some(UpdateResultReport {
            workflow_id: workflow.id,
            result_code: RESULT_SUCCESS,
            extended_result_codes: Vec::new(),
            result_details: None,
            timestamp: self.clock.now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::ManualClock;

    fn item(payload: &str) -> WorkItem {
        WorkItem {
            payload: payload.to_string(),
            time_added: ManualClock::new().now(),
        }
    }

    #[test]
    fn test_reports_new_workflow_once() {
        let clock = ManualClock::shared();
        let mut processor = LoggingUpdateProcessor::new(clock.clone());
        let doc = r#"{"workflow": {"id": "wf-7", "action": 3}, "updateManifest": "{}"}"#;

        let report = processor.process(&item(doc)).unwrap().unwrap();
        assert_eq!(report.workflow_id, "wf-7");
        assert_eq!(report.result_code, RESULT_SUCCESS);
        assert_eq!(report.timestamp, clock.now());

        assert!(processor.process(&item(doc)).unwrap().is_none());
    }

    #[test]
    fn test_document_without_workflow() {
        let mut processor = LoggingUpdateProcessor::new(ManualClock::shared());
        assert!(processor.process(&item("{}")).unwrap().is_none());
    }

    #[test]
    fn test_invalid_document() {
        let mut processor = LoggingUpdateProcessor::new(ManualClock::shared());
        assert!(matches!(
            processor.process(&item("not json")),
            Err(ProcessError::InvalidDocument(_))
        ));
    }
}
