//! pppwatch kernel : réconciliation des abonnés PPPoE et échantillonnage de débit
//! pour routeurs RouterOS.
//!
//! Pipeline par routeur : ingest -> normalize -> merge -> sampling -> downtime -> aggregate,
//! piloté par `scheduler::RouterMonitor` et exposé via `registry::MonitorRegistry`.

pub mod aggregate;
pub mod baseline;
pub mod config;
pub mod downtime;
pub mod error;
pub mod health;
pub mod http;
pub mod ingest;
pub mod merge;
pub mod models;
pub mod mqtt;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod sampling;
pub mod scheduler;
pub mod upstream;
pub mod views;

pub use error::{FetchError, MonitorError};
pub use models::{AggregateStats, MonitorEvent, Snapshot, SubscriberKey, SubscriberRow, SubscriberStatus};
pub use normalize::normalize;
pub use registry::{MonitorRegistry, RouterSettings};
