//! FUSE mount of a remote Android device's filesystem over ADB.
//!
//! Layout mirrors the component table in the design spec: [`path`] (C1),
//! [`wire`] (C2), [`rpc`] (C3/C4), [`connection`] (C5), [`cache`] (C6),
//! [`tree`] (C7), [`orchestrator`] (C8), [`control`] (C9). [`fs`] bridges
//! the tree to `fuser`'s callback trait; [`config`] and [`log`] are the
//! ambient CLI/tracing surface neither binary duplicates.

pub mod cache;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod fs;
pub mod log;
pub mod orchestrator;
pub mod path;
pub mod rpc;
pub mod tree;
pub mod wire;
