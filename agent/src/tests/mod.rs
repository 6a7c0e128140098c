//! Test modules for the agent crate

mod stream_tests;
