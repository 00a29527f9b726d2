//! Garden irrigation hub: sensor polling, pump control over a serial
//! controller or a relay pin, threshold-driven watering and a daily
//! schedule.

pub mod actuator;
pub mod auto_response;
pub mod config;
pub mod error;
pub mod garden;
pub mod relay;
pub mod scheduler;
pub mod sensor;
pub mod serial;
pub mod state;

pub use garden::Garden;
