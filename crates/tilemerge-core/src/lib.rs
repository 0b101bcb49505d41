// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod memtree;

pub use arena::{ArenaError, ScratchArena, Watermark};
pub use memtree::{MemFlags, MemNode, MemTree, NodeId};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
