//! Core pipeline orchestration for epgsync.
//!
//! This crate ties together the git checkouts, the external guide grabber,
//! downloadable guide sources and the container launcher into the `run` and
//! `launch` workflows.

pub mod download;
pub mod git;
pub mod grabber;
pub mod guide;
pub mod launcher;
pub mod pipeline;
pub mod process;
pub mod report;
