//! Generative language collaborator used as the worm's free-form conversation fallback.

pub mod http;
pub mod provider;
