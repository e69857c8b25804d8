//! In-crate scenario tests driving the pipeline over scripted collaborators

mod orchestrator_tests;
