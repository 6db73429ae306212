//! Library surface of the `mesh` CLI, shared by the binary and its
//! integration tests.

pub mod commands;
