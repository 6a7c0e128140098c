//! Test modules for the server crate

mod fixtures;
mod lifecycle_tests;
mod scheduler_tests;
