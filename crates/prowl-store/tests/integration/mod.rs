pub mod common;
pub mod session_store_tests;
