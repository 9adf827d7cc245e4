//! Relay state inference for power-metered appliances.
//!
//! Power sensors are polled on a cron cadence; each poll derives an on/off
//! relay state with hysteresis and appends it, together with the latest
//! power reading, to the property store.

pub mod cadence;
pub mod config;
pub mod db;
pub mod device;
pub mod factory;
pub mod hysteresis;
pub mod lease;
pub mod scheduler;
pub mod sensor;
pub mod source;
pub mod store;
