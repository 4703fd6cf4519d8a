#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cloudinit;
pub mod cluster;
pub mod config;
pub mod disk;
pub mod error;
pub mod flow;
pub mod reconciler;
pub mod template;
pub mod terminal;
pub mod util;
pub mod vm_config;
pub mod vm_state;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;
