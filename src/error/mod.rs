// src/error/mod.rs
//
// Error module
//
// One enum per concern: `Error` for the public surface, `KeyError` for key
// validation (src/key.rs), `StoreError` for backend failures (src/store).

pub mod types;

pub use types::{Error, Result};
