//! Durable key-value storage for the offline sync engine.
//!
//! This module provides a trait-based interface for storage backends
//! (in-memory, local filesystem) and a registry for resolving a backend
//! by name.
//!
//! # Design Principles
//! - Backend isolation: the sync engine only sees [`KeyValueStore`]
//! - Async operations: All I/O operations are async
//! - Best-effort callers: the engine degrades to memory-only operation
//!   when a backend fails, so backends report errors rather than retrying

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use provider::{load_json, save_json, KeyValueStore};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
