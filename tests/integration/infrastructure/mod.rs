pub mod stub_harness;

pub use stub_harness::{free_port, process_exists, stub_binary, StubHarness, TEST_THROTTLE};
