//! A disk-backed, ordered B-Tree index over integer keys.
//!
//! [`btree::BTree`] is the public entry point: open a database file, then
//! `insert`, `search`, and `delete` keys. [`node`] and [`storage`] are the
//! two layers it's built from and are exposed for tests and tooling that
//! need to inspect them directly.
pub mod btree;
pub mod errors;
pub mod node;
pub mod storage;

pub use btree::BTree;
pub use errors::Error;
