//! The ephemeral object store, leaf components first.

pub mod id_generator;
pub mod blob_store;
pub mod registry;
pub mod lifecycle;
pub mod object_service;
