pub mod common;
mod fingerprint_tests;
