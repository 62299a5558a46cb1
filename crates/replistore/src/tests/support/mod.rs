//! Test doubles and fixtures for the assembly suites.

mod driver_builder;
mod opener;
mod reporter;
mod world;

pub use driver_builder::{RecordedRequest, RecordingDriverBuilder};
pub use opener::SchemaOpener;
pub use reporter::AssemblyEvent;
pub use world::{TestWorld, versioned_row, world};

/// Version-history table shared by the legacy and destination databases.
pub const KINE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kine (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    name TEXT, \
    created INTEGER, \
    deleted INTEGER, \
    create_revision INTEGER, \
    prev_revision INTEGER, \
    lease INTEGER, \
    value BLOB, \
    old_value BLOB)";
