//! Network-facing primitives shared by the pool, info client, and tender.

pub mod resolver;
