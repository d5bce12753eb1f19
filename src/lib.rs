//! Resumable company-enrichment engine.
//!
//! An import session starts with a primary search job that seeds company
//! documents from an AI completion endpoint, then a queue-driven resume
//! worker enriches each document field by field across bounded cycles.
//! Every invocation runs under a wall-clock budget and persists after each
//! field, so interrupted work resumes instead of restarting.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod workers;
