//! Infrastructure layer for the driver.
//!
//! Contains the adapters the protocol session runs on: byte transports
//! (TCP, serial, mock), the notification sink, the periodic job scheduler,
//! and configuration file storage.

pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod transport;
