//! Core types and runtime primitives shared across the Vaulthalla workspace

pub mod error;
pub mod service;
pub mod types;

pub use error::{Error, Result};
pub use service::{AsyncService, ServiceContext, ServiceHandle};
