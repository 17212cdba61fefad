//! CLI command implementations.
//!
//! Each command opens the database directly and calls module functions — no
//! inference services are needed for maintenance and inspection, so the
//! commands run without the embedding model or extractor configured.

pub mod doctor;
pub mod sleep;
pub mod stats;
