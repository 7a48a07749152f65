//! BLE device discovery and connection workflow.
//!
//! - [`domain`] - state model, settings and the shared store
//! - [`infrastructure`] - adapter traits, workflow components, dispatcher, logging
//! - [`presentation`] - interactive console front end

pub mod domain;
pub mod infrastructure;
pub mod presentation;
