//! ACENCIA ATLAS - back-office client for insurance document
//! processing.
//!
//! Ingests BiPRO deliveries, mails, scans and manual uploads,
//! classifies every document through a deterministic decision ladder
//! and files it into typed boxes on the archive server.

pub mod api;
pub mod batch;
pub mod bipro;
pub mod cache;
pub mod classify;
pub mod cli;
pub mod config;
pub mod containers;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod pdf;
pub mod probe;
pub mod rules;
