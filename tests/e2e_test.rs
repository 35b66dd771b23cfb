//! End-to-end tests, running the kiln binary against a temp directory.

mod e2e;
