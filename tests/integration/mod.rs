//! Integration tests for the backup harness
//!
//! Every scenario runs the real supervisor and verifier against the
//! `backup-stub` binary, which stands in for the game server and its plugin.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::StubHarness;
