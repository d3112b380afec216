//! Detection settings and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use getset::{CopyGetters, Getters};
use log::warn;

use crate::error::{Result, VfsError};

/// Cancellation signal plus an optional deadline.
///
/// Clones share the same flag, so a caller keeps one handle and hands clones to
/// the detection and traversal code that checks it.
#[derive(Clone, Debug, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a control that reports [`VfsError::TimedOut`] once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Requests cancellation of every operation sharing this control.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Checks the signal and the deadline.
    ///
    /// # Errors
    /// - `VfsError::Cancelled` once [`ScanControl::cancel`] was called
    /// - `VfsError::TimedOut` once the deadline has passed
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(VfsError::TimedOut),
            _ => Ok(()),
        }
    }
}

const MIN_SECTOR_SIZE: usize = 512;
const MAX_SECTOR_SIZE: usize = 65536;

/// Settings used while detecting partitions and filesystems on a disk.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct DetectOptions {
    /// The logical sector size of the image in bytes.
    #[get_copy = "pub"]
    sector_size: usize,
    /// Enables the strict boot-sector checks (jump instruction, signatures).
    #[get_copy = "pub"]
    strict_validation: bool,
    /// Cancellation and deadline shared by detection and traversal.
    #[get = "pub"]
    control: ScanControl,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            sector_size: 512,
            strict_validation: true,
            control: ScanControl::new(),
        }
    }
}

impl DetectOptions {
    /// Sets the logical sector size.
    ///
    /// Sizes that are not a power of two between 512 and 65536 bytes are
    /// ignored with a warning, leaving the previous size in place.
    pub fn sector_size_of(mut self, sector_size: usize) -> Self {
        if sector_size.is_power_of_two() && (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size) {
            self.sector_size = sector_size;
        } else {
            warn!(
                "Ignoring sector size {sector_size}, keeping {} bytes",
                self.sector_size
            );
        }
        self
    }

    pub fn strict(mut self, strict_validation: bool) -> Self {
        self.strict_validation = strict_validation;
        self
    }

    pub fn control_of(mut self, control: ScanControl) -> Self {
        self.control = control;
        self
    }
}
