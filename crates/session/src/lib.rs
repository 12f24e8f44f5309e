//! Session persistence backends for Deepnest.
//!
//! The [`deepnest_core::session::SessionStore`] trait is implemented here
//! twice: a file-backed store for durable sessions and an in-memory store
//! for tests. Both give fail-fast busy semantics on concurrent opens of
//! the same session id.

pub mod file_store;
pub mod in_memory;

pub use file_store::FileSessionStore;
pub use in_memory::InMemorySessionStore;
