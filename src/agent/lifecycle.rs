//! Device agent lifecycle
//!
//! [`DeviceAgent`] owns the connection session, the operations and the two
//! work queues, and drives them from one periodic loop:
//!
//! 1. pump the session (connect, receive, resubscribe)
//! 2. route the events the session reported to the operations
//! 3. give every operation one `do_work` pass
//! 4. hand accepted deployments to the update processor
//! 5. publish queued update results

use crate::agent::inbox::{inbox, ChannelEvent, DEFAULT_INBOX_CAPACITY};
use crate::agent::processor::{LoggingUpdateProcessor, UpdateProcessor};
use crate::clock::SharedClock;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::operations::{
    AgentInfoOperation, DeviceIdentity, EnrollmentOperation, RetriableOperation,
    UpdateOperation, UpdateResultReporter,
};
use crate::protocol::MessageType;
use crate::state_store::ProvisioningStore;
use crate::transport::mqtt::{ConnectionSession, SessionConfig, TopicProvider};
use crate::transport::{InboundMessage, MqttEngine};
use crate::workqueue::WorkQueue;
use crate::{lifecycle_span, mqtt_span, operation_span};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Name of the queue holding accepted deployment documents
pub const UPDATE_QUEUE_NAME: &str = "update";
/// Name of the queue holding result reports waiting to be published
pub const REPORTING_QUEUE_NAME: &str = "reporting";

/// The device agent: one session, its operations and the main loop
pub struct DeviceAgent<E: MqttEngine> {
    session: ConnectionSession<E>,
    events: mpsc::Receiver<ChannelEvent>,
    enrollment: EnrollmentOperation,
    agent_info: AgentInfoOperation,
    update: UpdateOperation,
    reporter: UpdateResultReporter,
    update_queue: WorkQueue,
    reporting_queue: WorkQueue,
    processor: Box<dyn UpdateProcessor>,
    do_work_interval: Duration,
}

/// Response topics the session subscribes to on every new connection
fn response_topics(identity: &DeviceIdentity) -> Vec<String> {
    [false, true]
        .into_iter()
        .filter_map(|scoped| identity.topics(scoped).ok())
        .map(|topics| topics.response)
        .collect()
}

impl<E: MqttEngine> DeviceAgent<E> {
    /// Build the agent from validated configuration
    pub fn new(
        config: &AgentConfig,
        engine: E,
        store: Arc<dyn ProvisioningStore>,
        clock: SharedClock,
    ) -> AgentResult<Self> {
        config.validate()?;

        let identity = DeviceIdentity::new(store.clone(), config.agent.device_id.clone());
        let (handler, events) = inbox(DEFAULT_INBOX_CAPACITY);

        let provider_identity = identity.clone();
        let topic_provider: TopicProvider = Box::new(move || response_topics(&provider_identity));

        let session = ConnectionSession::new(
            engine,
            SessionConfig::from_config(&config.mqtt),
            clock.clone(),
        )
        .with_store(store)
        .with_handler(Box::new(handler))
        .with_topic_provider(topic_provider);

        let update_queue = WorkQueue::new(
            UPDATE_QUEUE_NAME,
            config.queues.update_capacity,
            clock.clone(),
        );
        let reporting_queue = WorkQueue::new(
            REPORTING_QUEUE_NAME,
            config.queues.reporting_capacity,
            clock.clone(),
        );

        let operations = &config.operations;
        Ok(Self {
            session,
            events,
            enrollment: EnrollmentOperation::new(
                &operations.enrollment,
                identity.clone(),
                clock.clone(),
            ),
            agent_info: AgentInfoOperation::new(
                &operations.agent_info,
                identity.clone(),
                config.agent.manufacturer.clone(),
                config.agent.model.clone(),
                clock.clone(),
            ),
            update: UpdateOperation::new(
                &operations.update,
                identity.clone(),
                update_queue.clone(),
                clock.clone(),
            ),
            reporter: UpdateResultReporter::new(identity),
            update_queue,
            reporting_queue,
            processor: Box::new(LoggingUpdateProcessor::new(clock)),
            do_work_interval: Duration::from_millis(config.agent.do_work_interval_ms.max(1)),
        })
    }

    /// Replace the default logging processor
    pub fn with_processor(mut self, processor: Box<dyn UpdateProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn session(&self) -> &ConnectionSession<E> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConnectionSession<E> {
        &mut self.session
    }

    pub fn enrollment(&self) -> &EnrollmentOperation {
        &self.enrollment
    }

    pub fn agent_info(&self) -> &AgentInfoOperation {
        &self.agent_info
    }

    pub fn update(&self) -> &UpdateOperation {
        &self.update
    }

    pub fn reporter(&self) -> &UpdateResultReporter {
        &self.reporter
    }

    pub fn update_queue(&self) -> &WorkQueue {
        &self.update_queue
    }

    pub fn reporting_queue(&self) -> &WorkQueue {
        &self.reporting_queue
    }

    pub fn do_work_interval(&self) -> Duration {
        self.do_work_interval
    }

    /// One pass of the main loop
    pub async fn do_work(&mut self) {
        let state = self.session.state();
        self.session
            .do_work()
            .instrument(mqtt_span!(state = state.as_str()))
            .await;

        self.route_events();

        let operations: [&mut dyn RetriableOperation; 3] =
            [&mut self.enrollment, &mut self.agent_info, &mut self.update];
        for operation in operations {
            let _span = operation_span!(name = operation.name()).entered();
            operation.do_work(&mut self.session);
        }

        self.process_updates();
        self.reporter.drain(&mut self.session, &self.reporting_queue);
    }

    /// Drive the loop until `shutdown` resolves, then close the session
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "Device agent running (do-work interval {:?})",
            self.do_work_interval
        );
        let mut ticker = tokio::time::interval(self.do_work_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.do_work().await,
            }
        }

        self.shutdown();
    }

    /// Cancel in-flight operations and close the connection
    pub fn shutdown(&mut self) {
        let _span = lifecycle_span!(phase = "shutdown").entered();
        self.enrollment.cancel();
        self.agent_info.cancel();
        self.update.cancel();
        self.session.shutdown();
        info!(
            pending_updates = self.update_queue.len(),
            pending_reports = self.reporting_queue.len(),
            "Device agent stopped"
        );
    }

    fn route_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ChannelEvent::ConnAck { reason_code } => {
                    debug!("Channel connected ({:#04x})", reason_code);
                }
                ChannelEvent::Disconnected { reason_code } => {
                    debug!("Channel disconnected ({:#04x})", reason_code);
                }
                ChannelEvent::Message {
                    message,
                    message_type,
                } => self.route_message(&message, message_type),
                ChannelEvent::PublishAck {
                    message_id,
                    reason_code,
                } => self.update.handle_publish_ack(message_id, reason_code),
                ChannelEvent::Subscribed(outcome) => {
                    if !outcome.is_success() {
                        warn!(
                            "Subscription to {:?} refused: {:?}",
                            outcome.topics, outcome.granted
                        );
                    }
                }
            }
        }
    }

    fn route_message(&mut self, message: &InboundMessage, message_type: MessageType) {
        let handled = match message_type {
            MessageType::EnrollmentResponse | MessageType::EnrollmentChangeNotification => {
                self.enrollment.handle_message(message, message_type)
            }
            MessageType::AgentInfoResponse => self.agent_info.handle_message(message, message_type),
            MessageType::UpdateResponse | MessageType::UpdateAvailableNotification => {
                self.update.handle_message(message, message_type)
            }
            MessageType::UpdateResultResponse | MessageType::UpdateResultAck => {
                self.reporter.handle_message(message, message_type)
            }
            MessageType::EnrollmentRequest
            | MessageType::AgentInfoRequest
            | MessageType::UpdateRequest
            | MessageType::UpdateResultRequest => {
                warn!(
                    "Ignoring device-to-service message '{}' on '{}'",
                    message_type, message.topic
                );
                true
            }
        };
        if !handled {
            debug!("No handler took '{}'", message_type);
        }
    }

    fn process_updates(&mut self) {
        let Some(item) = self.update_queue.try_dequeue() else {
            return;
        };

        match self.processor.process(&item) {
            Ok(Some(report)) => match serde_json::to_string(&report) {
                Ok(json) => {
                    if let Err(e) = self.reporting_queue.enqueue(json) {
                        warn!("Result for workflow '{}' not queued: {}", report.workflow_id, e);
                    }
                }
                Err(e) => error!("Failed to encode update result: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Deployment processing failed: {}", e),
        }
        self.update.on_processing_complete();
    }
}
