use crate::arena::CursorError;
use crate::mmap::MemoryMapError;
use crate::pagetable::PageTableError;
use crate::platform::{EnvError, FileError, FirmwareError, VideoError};
use crate::relocator::RelocatorError;

#[derive(Debug, thiserror::Error)]
pub enum BsdError {
    #[error("Invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("Unsupported kernel image: {0}")]
    BadFormat(&'static str),
    #[error("Invalid a.out header")]
    BadHeader,
    #[error("Kernel load address {0:#x} is below 1 MiB")]
    LoadAddressTooLow(u64),
    #[error("The CPU does not implement the AMD64 architecture")]
    UnsupportedCpu,
    #[error("Failed to read {0}")]
    ReadError(&'static str),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("The firmware memory map changed between passes ({expected} vs. {found} records)")]
    MemoryMapMismatch { expected: usize, found: usize },
    #[error("The firmware memory map changed between passes at record {0}")]
    MemoryMapChanged(usize),
    #[error("Platform failure: {0}")]
    PlatformFailure(&'static str),
}

impl BsdError {
    /// Whether the error leaves the machine in a state that cannot be recovered from.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PlatformFailure(_))
    }
}

impl From<RelocatorError> for BsdError {
    fn from(value: RelocatorError) -> Self {
        match value {
            RelocatorError::Unavailable { .. } | RelocatorError::NoWindow { .. } => Self::OutOfMemory,
            RelocatorError::InvalidChunk => Self::BadArgument("unknown relocator chunk"),
            RelocatorError::Handoff(reason) => Self::PlatformFailure(reason),
        }
    }
}

impl From<CursorError> for BsdError {
    fn from(_: CursorError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MemoryMapError> for BsdError {
    fn from(value: MemoryMapError) -> Self {
        match value {
            MemoryMapError::Mismatch { expected, found } => {
                Self::MemoryMapMismatch { expected, found }
            }
            MemoryMapError::Changed { index } => Self::MemoryMapChanged(index),
            MemoryMapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl From<PageTableError> for BsdError {
    fn from(_: PageTableError) -> Self {
        Self::OutOfMemory
    }
}

impl From<FileError> for BsdError {
    fn from(value: FileError) -> Self {
        match value {
            FileError::NotFound => Self::BadArgument("file not found"),
            FileError::Io => Self::ReadError("file"),
        }
    }
}

impl From<EnvError> for BsdError {
    fn from(value: EnvError) -> Self {
        match value {
            EnvError::InvalidName => Self::BadArgument("invalid variable name"),
            EnvError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl From<FirmwareError> for BsdError {
    fn from(value: FirmwareError) -> Self {
        match value {
            FirmwareError::ExitBootServices => Self::PlatformFailure("cannot exit boot services"),
        }
    }
}

impl From<VideoError> for BsdError {
    fn from(_: VideoError) -> Self {
        Self::PlatformFailure("video")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_platform_failures_are_fatal() {
        assert!(BsdError::PlatformFailure("x").is_fatal());
        assert!(!BsdError::OutOfMemory.is_fatal());
        assert!(!BsdError::BadArgument("x").is_fatal());
    }

    #[test]
    fn relocator_errors_map_to_out_of_memory() {
        let e: BsdError = RelocatorError::Unavailable {
            target: 0x10_0000,
            size: 16,
        }
        .into();
        assert!(matches!(e, BsdError::OutOfMemory));

        let e: BsdError = RelocatorError::Handoff("returned").into();
        assert!(e.is_fatal());
    }
}
