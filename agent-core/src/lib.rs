//! Low-level, reusable I/O primitives shared by the proxy binary.
//!
//! This crate holds the pieces that have no opinion about HTTP or policy:
//! a resizable buffered reader and a bidirectional byte-splicing loop.

pub mod copy;
