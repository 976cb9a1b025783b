// crates/telemetry-store/tests/helpers/mod.rs
// ============================================================================
// Module: Store Test Helpers
// Description: Shared fixtures for live-backend store tests.
// Purpose: Provide disposable Postgres databases.
// Dependencies: testcontainers, postgres
// ============================================================================

//! ## Overview
//! Shared fixtures for tests that need a running database server.

pub mod infra;
