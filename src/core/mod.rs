//! Core gateway primitives: models, errors, configuration and admission control

pub mod config;
pub mod errors;
pub mod models;
pub mod quota;
pub mod rate_limiter;
