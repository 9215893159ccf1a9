//! Task envelope and remote object addressing.

pub mod envelope;
pub mod uri;

pub use envelope::{FileMapping, TaskEnvelope, confined_path};
pub use uri::ObjectUri;
