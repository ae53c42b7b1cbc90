//! Bluetooth Module
//!
//! Provides BLE communication with the smart box.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SmartboxService                       │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ DeviceLink │ │  Protocol  │ │ Transport  │
//! │            │ │            │ │            │
//! │ - Connect  │ │ - UUIDs    │ │ - WinRT    │
//! │ - Notify   │ │ - Slot     │ │   GATT     │
//! │ - Write    │ │   codec    │ │            │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Smart box wire format, UUIDs and slot codec
//! - [`transport`] - Seam to the OS BLE stack
//! - [`link`] - Connection lifecycle, subscriptions and writes
//! - [`service`] - Main service coordinator

pub mod link;
pub mod protocol;
pub mod service;
pub mod transport;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub mod mock;

// Re-export main service for convenience
pub use service::SmartboxService;
