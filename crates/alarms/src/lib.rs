//! O2IMS alarms service.
//!
//! Alertmanager alerts (pushed to the webhook or pulled from its API) become alarm event
//! records; every changed record is matched against the subscription index and delivered
//! to the matching callbacks by detached tasks. Resolved records are pruned once they
//! outlive the configured retention period.

#![forbid(unsafe_code)]

pub mod alertmanager;
pub mod config;
pub mod infrastructure;
pub mod ingest;
pub mod notifier;
pub mod records;
pub mod server;
pub mod service_config;
pub mod subscriptions;

pub use config::{AlertmanagerConfig, DispatcherConfig};
pub use infrastructure::{ClusterServerClient, InfrastructureCache, InventoryClient};
pub use ingest::{AlarmPipeline, Source};
pub use notifier::Dispatcher;
pub use records::{AlarmEventRecord, AlarmRepository, AlarmsHandler, NewAlarm, PerceivedSeverity};
pub use server::{AlarmsServer, ServerOptions};
pub use service_config::{ServiceConfigHandler, ServiceConfiguration};
pub use subscriptions::SubscriptionsHandler;
