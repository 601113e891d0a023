//! Update result reporting
//!
//! Drains the reporting queue and publishes each report as an
//! `updrslt_req`. A report whose publish fails is held and sent before
//! anything still queued, so reports leave in the order they were queued.
//! Responses are matched against the reports still in flight and only
//! logged; a lost report is not resent.

use super::common::{prepare_request, publish_request, DeviceIdentity, RequestError};
use crate::protocol::{
    correlation_matches, read_common_response_properties, CorrelationId, MessageType,
    UpdateResultReport,
};
use crate::transport::{InboundMessage, MessageChannel};
use crate::workqueue::{WorkItem, WorkQueue};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Reports remembered for response matching
const MAX_OUTSTANDING_REPORTS: usize = 16;

#[derive(Debug)]
struct OutstandingReport {
    correlation_id: CorrelationId,
    workflow_id: String,
}

#[derive(Debug)]
pub struct UpdateResultReporter {
    identity: DeviceIdentity,
    outstanding: VecDeque<OutstandingReport>,
    /// Report taken off the queue whose publish failed
    held: Option<WorkItem>,
}

impl UpdateResultReporter {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            outstanding: VecDeque::new(),
            held: None,
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether a report is waiting to be retried ahead of the queue
    pub fn has_held_report(&self) -> bool {
        self.held.is_some()
    }

    /// Publish every queued report the channel can take right now.
    /// Returns the number of reports sent.
    pub fn drain(&mut self, channel: &mut dyn MessageChannel, queue: &WorkQueue) -> usize {
        if self.held.is_none() && queue.is_empty() {
            return 0;
        }
        let topics = match prepare_request(channel, &self.identity, true) {
            Ok(topics) => topics,
            Err(reason) => {
                debug!("update result: not reporting yet, {}", reason);
                return 0;
            }
        };

        let mut sent = 0;
        while let Some(item) = self.held.take().or_else(|| queue.try_dequeue()) {
            let report: UpdateResultReport = match serde_json::from_str(&item.payload) {
                Ok(report) => report,
                Err(e) => {
                    error!("update result: dropping malformed report: {}", e);
                    continue;
                }
            };

            let correlation_id = CorrelationId::generate();
            match publish_request(
                channel,
                &topics.publish,
                MessageType::UpdateResultRequest,
                &correlation_id,
                &report,
            ) {
                Ok(_) => {
                    info!(
                        "Reported result {} for workflow {}",
                        report.result_code, report.workflow_id
                    );
                    self.remember(correlation_id, report.workflow_id);
                    sent += 1;
                }
                Err(RequestError::Send(e)) => {
                    warn!(
                        "update result: publish failed, holding report for {}: {}",
                        report.workflow_id, e
                    );
                    self.held = Some(item);
                    break;
                }
                Err(RequestError::Encode(e)) => {
                    error!("update result: cannot encode report: {}", e);
                }
            }
        }
        sent
    }

    fn remember(&mut self, correlation_id: CorrelationId, workflow_id: String) {
        if self.outstanding.len() >= MAX_OUTSTANDING_REPORTS {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(OutstandingReport {
            correlation_id,
            workflow_id,
        });
    }

    /// Accept `updrslt_resp` and `updrslt_ack`; returns false for anything else
    pub fn handle_message(&mut self, message: &InboundMessage, message_type: MessageType) -> bool {
        match message_type {
            MessageType::UpdateResultResponse => {
                self.handle_response(message);
                true
            }
            MessageType::UpdateResultAck => {
                info!("Update result acknowledged by the service");
                true
            }
            _ => false,
        }
    }

    fn handle_response(&mut self, message: &InboundMessage) {
        let Some(index) = self
            .outstanding
            .iter()
            .position(|r| correlation_matches(&message.properties, &r.correlation_id))
        else {
            debug!("update result: dropping response with unknown correlation id");
            return;
        };

        let common = match read_common_response_properties(
            &message.properties,
            MessageType::UpdateResultResponse,
        ) {
            Ok(common) => common,
            Err(e) => {
                warn!("update result: invalid response properties: {}", e);
                return;
            }
        };

        let Some(report) = self.outstanding.remove(index) else {
            return;
        };
        if common.is_success() {
            info!("Service accepted result for workflow {}", report.workflow_id);
        } else {
            warn!(
                "Service returned {} for workflow {} result ({})",
                common.result(),
                report.workflow_id,
                common.extended_result().description()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::{AgentStateStore, ProvisioningStore};
    use crate::testing::{response_message, ManualClock, RecordingChannel};
    use chrono::Utc;
    use std::sync::Arc;

    const RESPONSE_TOPIC: &str = "adu/oto/dev-1/s/scope-1";

    fn reporter() -> UpdateResultReporter {
        let store = AgentStateStore::in_memory();
        store.set_scope_id(Some("scope-1".to_string())).unwrap();
        UpdateResultReporter::new(DeviceIdentity::new(
            Arc::new(store),
            Some("dev-1".to_string()),
        ))
    }

    fn report_json(workflow_id: &str) -> String {
        serde_json::to_string(&UpdateResultReport {
            workflow_id: workflow_id.to_string(),
            result_code: 700,
            extended_result_codes: vec![],
            result_details: None,
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn test_drains_queue_when_ready() {
        let queue = WorkQueue::new("reporting", 4, ManualClock::shared());
        queue.enqueue(report_json("wf-1")).unwrap();
        queue.enqueue(report_json("wf-2")).unwrap();
        let mut channel = RecordingChannel::connected_with(&[RESPONSE_TOPIC]);
        let mut reporter = reporter();

        assert_eq!(reporter.drain(&mut channel, &queue), 2);
        assert!(queue.is_empty());
        let sent = channel.last_published().unwrap();
        assert_eq!(sent.topic, "adu/oto/dev-1/a/scope-1");
        assert_eq!(sent.properties.message_type(), Some("updrslt_req"));
        assert_eq!(sent.payload_json().unwrap()["workflowId"], "wf-2");
        assert_eq!(reporter.outstanding_count(), 2);
    }

    #[test]
    fn test_keeps_reports_while_disconnected() {
        let queue = WorkQueue::new("reporting", 4, ManualClock::shared());
        queue.enqueue(report_json("wf-1")).unwrap();
        let mut channel = RecordingChannel::default();
        assert_eq!(reporter().drain(&mut channel, &queue), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_holds_report_on_publish_failure() {
        let queue = WorkQueue::new("reporting", 4, ManualClock::shared());
        queue.enqueue(report_json("wf-1")).unwrap();
        let mut channel = RecordingChannel::connected_with(&[RESPONSE_TOPIC]);
        channel.fail_next_publish(crate::transport::SessionError::NotConnected);
        let mut reporter = reporter();

        assert_eq!(reporter.drain(&mut channel, &queue), 0);
        assert!(reporter.has_held_report());
        assert!(queue.is_empty());

        assert_eq!(reporter.drain(&mut channel, &queue), 1);
        assert!(!reporter.has_held_report());
    }

    #[test]
    fn test_failed_report_keeps_its_place() {
        let queue = WorkQueue::new("reporting", 4, ManualClock::shared());
        queue.enqueue(report_json("wf-A")).unwrap();
        queue.enqueue(report_json("wf-B")).unwrap();
        let mut channel = RecordingChannel::connected_with(&[RESPONSE_TOPIC]);
        channel.fail_next_publish(crate::transport::SessionError::NotConnected);
        let mut reporter = reporter();

        reporter.drain(&mut channel, &queue);
        queue.enqueue(report_json("wf-C")).unwrap();
        assert_eq!(reporter.drain(&mut channel, &queue), 3);

        let order: Vec<String> = channel
            .published
            .iter()
            .map(|m| m.payload_json().unwrap()["workflowId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["wf-A", "wf-B", "wf-C"]);
    }

    #[test]
    fn test_matches_response() {
        let queue = WorkQueue::new("reporting", 4, ManualClock::shared());
        queue.enqueue(report_json("wf-1")).unwrap();
        let mut channel = RecordingChannel::connected_with(&[RESPONSE_TOPIC]);
        let mut reporter = reporter();
        reporter.drain(&mut channel, &queue);
        let cid = channel.last_published().unwrap().correlation_id().unwrap();

        let stranger = response_message(
            RESPONSE_TOPIC,
            MessageType::UpdateResultResponse,
            &CorrelationId::generate(),
            0,
            0,
            "",
        );
        assert!(reporter.handle_message(&stranger, MessageType::UpdateResultResponse));
        assert_eq!(reporter.outstanding_count(), 1);

        let response =
            response_message(RESPONSE_TOPIC, MessageType::UpdateResultResponse, &cid, 0, 0, "");
        reporter.handle_message(&response, MessageType::UpdateResultResponse);
        assert_eq!(reporter.outstanding_count(), 0);
    }
}
