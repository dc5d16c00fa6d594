//! matrix-sms-bridge — a Matrix ⇄ SMS/WhatsApp relay bridge.
//!
//! Single Rust binary. Each remote conversation appears as a Matrix room,
//! each remote number as a synthetic Matrix user. Inbound traffic arrives
//! on signed provider webhooks; outbound traffic goes through the
//! provider's REST API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod formatter;
pub mod matrix;
pub mod portal;
pub mod provider;
pub mod puppet;
pub mod store;
