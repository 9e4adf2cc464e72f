//! Integration test binary -- all integration tests consolidated into a single
//! binary to reduce link-time RAM usage.
//!
//! See the matklad pattern: <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod call_session;
mod fleet_dispatch;
