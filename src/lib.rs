//! Real-time coordination layer for an interactive presentation room: a
//! shared message bus with presence, a full WebRTC audio/video mesh between
//! participants, and an AI study-buddy pipeline that generates per-slide
//! questions up front and dispatches them when the presenter's speech covers
//! a slide's key phrases.

pub mod ai;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mesh;
pub mod persist;
pub mod room;
pub mod student;

pub use config::Config;
pub use error::{MeshError, Result};
