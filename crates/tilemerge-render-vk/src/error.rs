// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GfxError {
    #[error("could not find an adequate vulkan compatible gpu")]
    NoAdequateDevice,
    #[error("no memory type offers {required:?}")]
    NoMemoryType { required: vk::MemoryPropertyFlags },
    #[error("{op} returned {code}")]
    UnexpectedResult { op: &'static str, code: vk::Result },
    #[error("failed to load shader {}", path.display())]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("geometry needs {needed} bytes but the buffer holds {capacity}")]
    GeometryOverflow { needed: u64, capacity: u64 },
    #[error("shader module has no `main` entry point")]
    MissingEntryPoint,
}

impl GfxError {
    pub(crate) fn unexpected(op: &'static str, code: vk::Result) -> Self {
        Self::UnexpectedResult { op, code }
    }
}
