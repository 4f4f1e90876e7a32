pub mod control_client;
pub mod error;
pub mod fetch;
pub mod http;
pub mod manifest;
pub mod telemetry;
