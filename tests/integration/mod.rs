//! Integration tests for the creation kernel

mod berries;
mod cache;
mod deploy;
mod instances;
mod publish_failures;
mod replay;
mod support;
