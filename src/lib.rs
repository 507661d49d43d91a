//! Identity-consistent collection of single-face photo sets.
//!
//! `core` holds the pure building blocks (hashing, structural similarity,
//! face filtering, the duplicate registry and identity clustering);
//! `services` wires them to the filesystem, the network and the tokio
//! runtime.

pub mod config;
pub mod core;
pub mod services;

#[cfg(test)]
mod testutil;
