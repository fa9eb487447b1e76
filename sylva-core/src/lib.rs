//! Shared primitives, traits, and utilities for the sylva phylogenetics workspace.
//!
//! `sylva-core` provides the foundation the domain crates build on:
//!
//! - **Error types**: [`SylvaError`] and [`Result`] for structured error handling
//! - **Traits**: capability contracts [`Identifiable`], [`Storable`], [`Listenable`]
//! - **Versioned values**: [`Versioned`], the two-slot store/restore primitive
//! - **Event queues**: [`EventBus`] for change notifications without back-references

pub mod error;
pub mod listener;
pub mod traits;
pub mod versioned;

pub use error::{Result, SylvaError};
pub use listener::{EventBus, SubscriptionId};
pub use traits::*;
pub use versioned::Versioned;
