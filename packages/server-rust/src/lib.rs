//! Agora Server — HTTP forum gateway with session identity, daily quotas, and CSRF protection.

pub mod admission;
pub mod network;
pub mod session;
pub mod store;

pub use admission::{AdmissionConfig, AdmissionState, RouteTable};
pub use network::{NetworkConfig, NetworkModule};
