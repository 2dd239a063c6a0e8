//! Memoria — a persistent LLM job queue driving knowledge extraction.

pub mod admin;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod worker;
