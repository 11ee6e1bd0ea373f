//! Persistence for the ban table and the peer address table

pub mod flatfile;
pub mod hashing;

pub use flatfile::{FlatFile, PersistError};
