//! Shared helpers for the vmsync workspace.

pub mod id;
