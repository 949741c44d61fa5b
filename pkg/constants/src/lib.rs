//! Centralized constants for the pollcoord project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod runtime;
pub mod state;
