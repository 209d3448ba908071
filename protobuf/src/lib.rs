//! Generated wire types for the workernator service.
//!
//! The `.proto` file is the source of truth; this crate only re-exports what
//! `tonic-build` generates from it.

tonic::include_proto!("workernator");
