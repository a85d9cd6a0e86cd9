pub mod policy;
pub mod ports;
pub mod service;

pub use service::EntitlementServiceImpl;
