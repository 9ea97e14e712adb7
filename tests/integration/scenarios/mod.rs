pub mod backup_tests;
pub mod lifecycle_tests;
