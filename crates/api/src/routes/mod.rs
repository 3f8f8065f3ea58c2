pub mod accidents;
pub mod incidents;
pub mod monitor;
pub mod telemetry;
