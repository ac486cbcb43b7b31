//! facecheckd: HTTP front end over the facecheck registry and extractor.

pub mod api;
pub mod config;
