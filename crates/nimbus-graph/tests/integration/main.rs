//! Integration tests for nimbus-graph.
//!
//! Uses wiremock to simulate the Microsoft Graph API and verifies
//! end-to-end behavior of the client: delta paging, item operations,
//! chunked upload sessions, ranged downloads, token refresh, and retry
//! classification.

mod common;

mod test_delta;
mod test_items;
mod test_retry;
mod test_upload;
