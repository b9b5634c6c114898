//! ---
//! frau_section: "01-core-functionality"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Shared primitives and utilities for frau ports."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Shared primitives for the frau messaging workspace.
//! This crate exposes configuration loading, origin helpers and tracing
//! initialisation consumed by the protocol crate and its embedders.

pub mod config;
pub mod logging;
pub mod origin;

pub use config::{ClientConfig, FrauConfig, HostConfig, LoadedFrauConfig, LoggingConfig, PortConfig};
pub use logging::{init_tracing, LogFormat};
pub use origin::{extract_origin, WILDCARD_ORIGIN};
