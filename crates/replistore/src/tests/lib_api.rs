//! Tests that exercise the crate's public re-exports.

use std::sync::Arc;

use rstest::rstest;

use crate::{
    BackendConfig, CancellationToken, DriverRegistry, MigrationOutcome, SqliteDriver, Stage,
    new_backend,
};

use super::support::{RecordingDriverBuilder, SchemaOpener, TestWorld, versioned_row};

#[rstest]
fn new_backend_migrates_from_configured_legacy_path() {
    let world = TestWorld::new();
    world.seed_legacy(&[versioned_row(1, "/registry/a")]);
    let config = BackendConfig {
        dsn: world.dsn("peer=3:10.0.0.3:9000"),
        legacy_database: world.legacy_path(),
        ..BackendConfig::default()
    };
    let builder = RecordingDriverBuilder::default();

    let assembled = new_backend(
        &CancellationToken::new(),
        &config,
        Arc::new(DriverRegistry::new()),
        Arc::new(builder.clone()),
        SchemaOpener::default(),
    )
    .expect("backend assembles");

    assert_eq!(
        assembled.summary().migration,
        MigrationOutcome::Migrated { rows: 1 }
    );
    assert_eq!(builder.requests().len(), 1);
    assert_eq!(world.destination_rows(), 1);
    assert!(assembled.into_backend().policy.is_some());
}

#[rstest]
fn new_backend_surfaces_stage_errors() {
    let world = TestWorld::new();
    let registry = Arc::new(DriverRegistry::new());
    registry
        .register("dqlite", Arc::new(SqliteDriver))
        .expect("pre-register under the default name");
    let config = BackendConfig {
        dsn: world.dsn(""),
        legacy_database: world.legacy_path(),
        ..BackendConfig::default()
    };

    let error = new_backend(
        &CancellationToken::new(),
        &config,
        registry,
        Arc::new(RecordingDriverBuilder::default()),
        SchemaOpener::default(),
    )
    .expect_err("default name already taken");

    assert_eq!(error.stage(), Stage::Register);
}
