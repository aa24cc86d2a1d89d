//! Database layer for Manul Tracer
//!
//! Traces, sessions, users, messages and images live in one SQLite file.

mod sqlite;

pub use sqlite::SqliteStore;
