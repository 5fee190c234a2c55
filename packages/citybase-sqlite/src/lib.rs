/*
 * Citybase SQLite - SQLite Backend for the Import Core
 *
 * File-based persistent storage using SQLite.
 * Suitable for local development and testing.
 */

pub mod store;

pub use store::{SqliteStore, StoreSchema};
