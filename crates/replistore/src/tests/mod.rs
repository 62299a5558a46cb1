//! Test suites for backend assembly.

mod lib_api;
pub(crate) mod support;
