//! Descriptor-driven gRPC load generator.
//!
//! A run drives a configurable number of concurrent workers against a target
//! endpoint, invoking a method resolved at runtime from a proto file, a
//! descriptor set or server reflection, and streams per-call results into a
//! reporter through a bounded pipeline.

pub mod cfg;
pub mod cmd;
pub mod descriptor;
mod histogram;
pub mod logging;
pub mod payload;
pub mod printer;
pub mod reporter;
pub mod runner;
pub mod stat;
pub mod transport;
