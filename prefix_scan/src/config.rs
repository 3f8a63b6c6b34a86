use crate::error::ScanError;

/// Work-group size used when none is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// A block of one lane never coarsens the period, so the scan would not
/// terminate.
pub const MIN_BLOCK_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub block_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ScanConfig {
    pub fn with_block_size(block_size: usize) -> Self {
        Self { block_size }
    }

    /// Checks the block size against the scan's minimum and the device's
    /// largest work-group.
    pub fn validate(&self, max_block_size: usize) -> Result<(), ScanError> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(ScanError::invalid_argument(format!(
                "block size {} is below the minimum of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.block_size > max_block_size {
            return Err(ScanError::invalid_argument(format!(
                "block size {} exceeds the device limit of {}",
                self.block_size, max_block_size
            )));
        }
        Ok(())
    }
}
