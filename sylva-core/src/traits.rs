//! Core capability traits for the sylva workspace.
//!
//! Components compose these small contracts instead of sharing a base type:
//! a tree is [`Storable`] and [`Listenable`], a likelihood is [`Storable`],
//! operators are [`Identifiable`].

use crate::listener::SubscriptionId;

/// A component with a stable, human-readable identifier.
pub trait Identifiable {
    /// The identifier, unique within one chain.
    fn id(&self) -> &str;
}

/// A component that takes part in the MCMC store/accept/restore protocol.
///
/// The driver calls [`store_state`](Storable::store_state) before a proposal,
/// then exactly one of [`accept_state`](Storable::accept_state) or
/// [`restore_state`](Storable::restore_state).
pub trait Storable {
    /// Snapshot the current state.
    fn store_state(&mut self);

    /// Revert to the last snapshot.
    fn restore_state(&mut self);

    /// Keep the current state and discard the snapshot.
    fn accept_state(&mut self);
}

/// A component that publishes typed change notifications.
///
/// Subscribers hold only a [`SubscriptionId`], never a reference to the
/// publisher, and pull their pending events when they need them.
pub trait Listenable {
    /// The change notification type.
    type Event: Clone;

    /// Register interest and return the handle used to drain events.
    fn subscribe(&mut self) -> SubscriptionId;

    /// Stop publishing to `id` and drop its pending events.
    fn unsubscribe(&mut self, id: SubscriptionId);

    /// Take every event published since the last drain for `id`.
    fn drain_events(&mut self, id: SubscriptionId) -> Vec<Self::Event>;
}

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}
