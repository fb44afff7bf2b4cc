//! Balancer core: dispatcher, health monitor, metrics and the admin
//! surface dashboards talk to.

mod balancer;
mod dispatcher;
mod metrics;
mod monitor;

pub use balancer::{Balancer, StatusSnapshot};
pub use metrics::{Metrics, PerformanceSnapshot, RequestRecord};
pub use monitor::HealthMonitor;
