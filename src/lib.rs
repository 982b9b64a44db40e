// Library surface for headless/integration tests and reuse.
// Keep this lean to avoid coupling to bin-only types in main.rs.
pub mod api;
pub mod app_dirs;
pub mod attempts;
pub mod config;
pub mod error;
pub mod exercise;
pub mod numbers;
pub mod runtime;
pub mod session;
pub mod speech;
pub mod stats;
pub mod timer;
pub mod util;
pub mod validation;

pub use error::{ServiceError, SessionError};
pub use exercise::{Backend, Completion, ExerciseSession, Phase};
pub use session::SessionConfig;
