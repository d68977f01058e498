//! Domain layer - types shared by signaling and media

pub mod shared;

pub use shared::{DomainError, Result};
