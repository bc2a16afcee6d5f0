//! The I/O side of a merge.
//!
//! The scheduler decides when a merge runs and publishes its result; a
//! [`MergeExecutor`] does the actual work of turning input segments into one
//! output segment. Executors must never publish anything themselves: until
//! the scheduler commits the returned descriptor the output is invisible.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{PhalanxError, Result};
use crate::segment::SegmentDescriptor;
use crate::storage::{Storage, StorageOutput, segment_file_name};

/// Shared abort flag for one running merge.
#[derive(Debug, Clone, Default)]
pub struct MergeAbort {
    flag: Arc<AtomicBool>,
}

impl MergeAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the merge to stop at its next check.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail with [`PhalanxError::MergeAborted`] if the merge was aborted.
    pub fn check(&self, context: &str) -> Result<()> {
        if self.is_aborted() {
            Err(PhalanxError::aborted(context.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Performs merges on behalf of the scheduler.
pub trait MergeExecutor: Send + Sync + fmt::Debug {
    /// Merge `inputs` into a new segment with generation `output_generation`.
    /// Implementations should poll `abort` regularly and return
    /// [`PhalanxError::MergeAborted`] once it is set. On any error no output
    /// may be left behind.
    fn merge(
        &self,
        inputs: &[SegmentDescriptor],
        output_generation: u64,
        abort: &MergeAbort,
    ) -> Result<SegmentDescriptor>;

    /// Remove the output of a merge that was produced but not published.
    fn discard(&self, output_generation: u64) -> Result<()>;

    /// Physically delete retired segments.
    fn delete_segments(&self, generations: &[u64]) -> Result<()>;
}

/// Merge executor that concatenates segment files in a [`Storage`].
///
/// Each input is stored as `seg_{generation}.dat`. Only the share of an
/// input that belongs to live documents is copied, so the output is as large
/// as the live bytes of its inputs. The output is written under a temporary
/// name, verified against a CRC32 of the copied bytes and then renamed into
/// place.
pub struct StorageMergeExecutor {
    storage: Arc<dyn Storage>,
    chunk_size: usize,
}

impl fmt::Debug for StorageMergeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageMergeExecutor")
            .field("storage", &self.storage)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl StorageMergeExecutor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        StorageMergeExecutor {
            storage,
            chunk_size: 64 * 1024,
        }
    }

    /// Bytes copied between abort checks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn copy_inputs(
        &self,
        inputs: &[SegmentDescriptor],
        output: &mut dyn StorageOutput,
        abort: &MergeAbort,
    ) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];

        for input in inputs {
            abort.check("merge aborted between inputs")?;

            let mut reader = self.storage.open_input(&segment_file_name(input.generation))?;
            let file_size = reader.size()?;
            let mut remaining =
                (file_size as f64 * (1.0 - input.deleted_ratio())).round() as u64;

            while remaining > 0 {
                abort.check("merge aborted while copying")?;
                let want = remaining.min(buffer.len() as u64) as usize;
                let read = reader.read(&mut buffer[..want])?;
                if read == 0 {
                    return Err(PhalanxError::storage(format!(
                        "unexpected end of segment {} with {remaining} bytes left",
                        input.generation
                    )));
                }
                output.write_all(&buffer[..read])?;
                hasher.update(&buffer[..read]);
                remaining -= read as u64;
            }
        }

        Ok(hasher.finalize())
    }

    fn verify(&self, name: &str, expected: u32) -> Result<()> {
        let mut reader = self.storage.open_input(name)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let actual = hasher.finalize();
        if actual != expected {
            return Err(PhalanxError::storage(format!(
                "checksum mismatch for {name}: expected {expected:08x}, got {actual:08x}"
            )));
        }
        Ok(())
    }

    fn write_output(
        &self,
        inputs: &[SegmentDescriptor],
        temp_name: &str,
        abort: &MergeAbort,
    ) -> Result<u64> {
        let mut output = self.storage.create_output(temp_name)?;
        let checksum = self.copy_inputs(inputs, output.as_mut(), abort)?;
        let written = output.position();
        output.close()?;
        drop(output);

        self.verify(temp_name, checksum)?;
        Ok(written)
    }
}

impl MergeExecutor for StorageMergeExecutor {
    fn merge(
        &self,
        inputs: &[SegmentDescriptor],
        output_generation: u64,
        abort: &MergeAbort,
    ) -> Result<SegmentDescriptor> {
        let temp_name = format!(
            "merge_{output_generation}_{}.tmp",
            Uuid::new_v4().simple()
        );

        let published = self
            .write_output(inputs, &temp_name, abort)
            .and_then(|written| {
                self.storage
                    .rename_file(&temp_name, &segment_file_name(output_generation))?;
                Ok(written)
            });
        let written = match published {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete_file(&temp_name) {
                    warn!("failed to remove partial merge output {temp_name}: {cleanup}");
                }
                return Err(e);
            }
        };

        let live_docs = inputs.iter().map(|s| s.live_docs).sum();
        debug!(
            "merged {} segments into {} ({written} bytes, {live_docs} docs)",
            inputs.len(),
            segment_file_name(output_generation)
        );
        Ok(SegmentDescriptor::new(output_generation, written, live_docs))
    }

    fn discard(&self, output_generation: u64) -> Result<()> {
        self.storage
            .delete_file(&segment_file_name(output_generation))?;
        let prefix = format!("merge_{output_generation}_");
        for name in self.storage.list_files()? {
            if name.starts_with(&prefix) {
                self.storage.delete_file(&name)?;
            }
        }
        Ok(())
    }

    fn delete_segments(&self, generations: &[u64]) -> Result<()> {
        for &generation in generations {
            self.storage.delete_file(&segment_file_name(generation))?;
        }
        Ok(())
    }
}
