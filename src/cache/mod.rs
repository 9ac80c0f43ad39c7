//! Persistent download cache
//!
//! A content-addressed store keyed by canonicalised source, governed by
//! a layered policy tree read from `policy.yaml` on every build.
//!
//! # Lookup states
//!
//! | State      | Meaning                                        |
//! |------------|------------------------------------------------|
//! | `Hit`      | fresh payload served from disk                 |
//! | `StaleHit` | payload present, upstream revalidation needed  |
//! | `Miss`     | nothing cached for this source                 |
//! | `Ignored`  | policy disables caching for this source        |

pub mod entry;
pub mod journal;
pub mod policy;
pub mod store;

pub use entry::CacheEntry;
pub use policy::{EffectivePolicy, Eviction, ItemClass, Policy};
pub use store::{Admission, CacheStore, Lookup, RejectReason};
