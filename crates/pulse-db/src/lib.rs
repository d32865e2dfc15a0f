//! Database layer for the Pulse telemetry service.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. The metric store is the only writer; every
//! table it touches is created through versioned migrations managed here.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: no external database process required. WAL
//!   lets catch-up queries read while the producer loop appends.
//! - **`r2d2` connection pool**: bounded connection reuse shared between
//!   request handlers and the producer loop.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
