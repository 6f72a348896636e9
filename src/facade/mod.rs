//! Developer-friendly facade layer.
//!
//! The core breakers in [`crate::resilience`] are generic over any resource. This
//! layer wraps them with defaults tuned for notification providers.

pub mod provider;
