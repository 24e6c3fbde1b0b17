//! Domain services: validate the request, mutate the store, and (for
//! long-running mutations) enqueue the task that drives the transition
//! — all inside one transaction, so an accepted request is always
//! backed by a durable task.

pub mod application;
pub mod credential;
pub mod pipeline;
pub mod project;
pub mod workspace;
