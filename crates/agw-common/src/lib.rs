//! Shared protocol types for talking to an agent gateway.
//!
//! This crate provides:
//! - JSON wire frame serialization and parsing ([`frame`])
//! - Device-auth payload signing and verification ([`crypto`])
//! - Unpadded base64url helpers ([`b64url`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod b64url;
pub mod crypto;
pub mod frame;
pub mod types;

pub use frame::{ErrorShape, EventFrame, Frame, FrameError, RequestFrame, ResponseFrame};
