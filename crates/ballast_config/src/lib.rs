mod ballast;
mod servers;
mod strategy;
mod validation;

pub use ballast::BallastConfig;
pub use servers::{ServerList, parse_server_addr};
pub use strategy::StrategyKind;
pub use validation::ConfigReport;
