//! Core types, config, and errors for Parley.
//!
//! Everything that flows between pipeline stages lives here: the [`frame::Frame`]
//! model, the shared [`transcript::Transcript`], and the [`token::GenerationToken`]
//! used to invalidate in-flight work on barge-in.

pub mod config;
pub mod error;
pub mod frame;
pub mod token;
pub mod transcript;
