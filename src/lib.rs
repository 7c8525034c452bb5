#![forbid(unsafe_code)]

//! Core of the RedStream download service.
//!
//! Requests are turned into yt-dlp runs inside short-lived session
//! directories (`lifecycle`), which a background sweep reclaims once they
//! expire (`scheduler`). The binaries wire these together with configuration
//! and the HTTP router from `api`.

pub mod api;
pub mod config;
pub mod error;
pub mod formats;
pub mod index;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod probe;
pub mod scheduler;
pub mod security;
pub mod translate;
pub mod ytdlp;
