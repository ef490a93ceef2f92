//! Core types, config, errors, and collaborator traits for Conductor.

pub mod cache;
pub mod config;
pub mod error;
pub mod trace;
pub mod types;
