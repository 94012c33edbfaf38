//! Replix Core Library
//!
//! Core abstractions shared by the replix data-management services.
//! This crate provides:
//! - Storage endpoint (RSE) model with tier, type and capacity attributes
//! - The RSE expression language used to address sets of endpoints
//! - Common error handling

pub mod endpoint;
pub mod error;
pub mod expression;

pub use endpoint::{parse_tier, EndpointType, StorageEndpoint};
pub use error::{ReplixError, Result};
pub use expression::{Expr, ExpressionFilter};

/// Tier of primary, custodial-like endpoints
pub const TIER_PRIMARY: u8 = 1;
/// Tier of regional endpoints
pub const TIER_REGIONAL: u8 = 2;
/// Tier of local endpoints
pub const TIER_LOCAL: u8 = 3;
