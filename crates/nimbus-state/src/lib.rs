//! nimbus-state: embedded state store for Nimbus.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the site registry, the
//! append-only deployment log, per-tenant key-value entries and per-tenant
//! secrets.
//!
//! # Architecture
//!
//! Registry records are JSON-serialized into `&[u8]` value columns under
//! `{site}` and `{site}:{seq}` keys. Tenant data uses `(site, key)` tuple
//! keys, so a lookup can never reach outside the site it was issued for.
//!
//! Every operation is a single redb transaction: writers serialize, readers
//! see a consistent snapshot, and a reader racing a `set` observes either
//! the complete old value or the complete new one.
//!
//! The sandbox only ever sees the narrow [`KvStore`] and [`SecretProvider`]
//! traits. Enumeration and secret mutation exist only on [`StateStore`].

pub mod error;
pub mod kv;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use kv::{KvLimits, KvStore, SecretProvider, SecretValue};
pub use store::StateStore;
