//! MQTT v5 session core
//!
//! This module separates pure decisions from I/O so the state machine can be
//! tested with a scripted engine.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, timing constants and rumqttc options
//! - [`disconnect`] - Reason-code classification
//! - [`subscriptions`] - Pending and confirmed subscription tracking
//! - [`message_handler`] - Pure translation of rumqttc events
//! - [`client`] - The rumqttc-backed engine (impure I/O)
//! - [`session`] - The connection state machine
//!
//! # Usage
//!
//! ```rust,no_run
//! use du_agent::clock::system_clock;
//! use du_agent::config::AgentConfig;
//! use du_agent::transport::mqtt::{ConnectSettings, ConnectionSession, RumqttcEngine, SessionConfig};
//!
//! # tokio_test::block_on(async {
//! let config = AgentConfig::load_from_file(std::path::Path::new("du-agent.toml"))?;
//! let engine = RumqttcEngine::new(ConnectSettings::from_config(&config, "device-1"));
//! let mut session = ConnectionSession::new(
//!     engine,
//!     SessionConfig::from_config(&config.mqtt),
//!     system_clock(),
//! );
//! loop {
//!     session.do_work().await;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod disconnect;
pub mod message_handler;
pub mod session;
pub mod subscriptions;

pub use client::RumqttcEngine;
pub use connection::{configure_mqtt_options, ConnectSettings, ConnectionState, SessionTimings};
pub use disconnect::{classify, reason_code_str, DisconnectCategory};
pub use message_handler::{ErrorRoute, EventRoute, MessageHandler};
pub use session::{ChannelEventHandler, ConnectionSession, SessionConfig, TopicProvider};
pub use subscriptions::{SubscribeCallback, SubscribeOutcome, SubscriptionTracker};
