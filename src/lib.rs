//! Ecobulles usage monitor library
//!
//! This library talks to the Ecobulles water/CO2 cloud API and keeps a water usage
//! sensor and a CO2 bottle sensor fed from a self-rescheduling polling coordinator.

pub mod config;
pub mod ecobulles;
pub mod error;
pub mod integration;
pub mod poll_coordinator;
pub mod sensors;
pub mod usage_coordinator;

// Re-export commonly used types for easier access
pub use config::{AppConfig, Credentials};
pub use ecobulles::{DeviceRecord, EcobullesClient, UsageSnapshot, UsageWindow};
pub use error::{EcobullesError, SetupErrorCode};
pub use integration::{ConfigEntry, ConfigFlow, InMemoryDeviceRegistry, Integration, SetupOutcome};
pub use poll_coordinator::{PollCoordinator, PollEvent, PollSource};
pub use sensors::{Co2UsageSensor, EntityPublisher, Sensor, SensorState, WaterUsageSensor};
pub use usage_coordinator::UsageCoordinator;
