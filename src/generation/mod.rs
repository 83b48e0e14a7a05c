//! Generation use cases and their storage

pub mod orchestrator;
pub mod repository;

pub use orchestrator::{Admission, GenerationOutcome, Orchestrator};
pub use repository::{InMemoryRepository, Repository};
