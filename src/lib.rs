//! FireShield Relay Library
//!
//! Cloud-side verification of wildfire alerts raised by a remote sensor node.
//!
//! ## Architecture (leaves first)
//!
//! 1. SnapshotService - Capture adapter (field camera over HTTP)
//! 2. AiClient - Detection adapter (fire/smoke classification engine)
//! 3. SessionStore - Per-session image + sidecar artifacts
//! 4. StatusPublisher - Verified status republish to the broker
//! 5. VerificationSession - Timed capture/classify/aggregate state machine
//! 6. SessionRegistry - Active session accounting, shutdown gate
//! 7. AlertRouter - Inbound message dispatch
//! 8. MqttSubscriber - Broker subscription loop
//! 9. Notifier - Chat notifications
//! 10. WebAPI - Status endpoints
//!
//! ## Data flow
//!
//! broker message → AlertRouter → (hazard) VerificationSession spawned and
//! registered → capture → classify → store, per tick → aggregate →
//! StatusPublisher → deregister

pub mod ai_client;
pub mod alert_router;
pub mod call_guard;
pub mod error;
pub mod models;
pub mod mqtt_subscriber;
pub mod notifier;
pub mod session_registry;
pub mod session_store;
pub mod snapshot_service;
pub mod state;
pub mod status_publisher;
pub mod verdict_log;
pub mod verification_session;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
