//! Test modules for the shared crate

mod wire_compat_tests;
