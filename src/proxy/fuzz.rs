//! Error-injection knobs for stress testing the proxy state machine.
//!
//! A scaler of N fails every Nth operation of its class; all scalers
//! default to zero, which disables injection entirely. Release builds must
//! never ship non-zero scalers.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::remote::{RemoteStatus, StatusCode};

#[derive(Debug, Default)]
pub struct Fuzzing {
    open_submit_scaler: AtomicUsize,
    open_submit_counter: AtomicUsize,
    open_return_scaler: AtomicUsize,
    open_return_counter: AtomicUsize,
    read_return_scaler: AtomicUsize,
    read_return_counter: AtomicUsize,
}

impl Fuzzing {
    pub fn configure(&self, open_submit: usize, open_return: usize, read_return: usize) {
        self.open_submit_scaler.store(open_submit, Ordering::Relaxed);
        self.open_return_scaler.store(open_return, Ordering::Relaxed);
        self.read_return_scaler.store(read_return, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.open_submit_scaler.load(Ordering::Relaxed) != 0
            || self.open_return_scaler.load(Ordering::Relaxed) != 0
            || self.read_return_scaler.load(Ordering::Relaxed) != 0
    }

    fn fire(scaler: &AtomicUsize, counter: &AtomicUsize) -> bool {
        let scale = scaler.load(Ordering::Relaxed);
        if scale == 0 {
            return false;
        }
        counter.fetch_add(1, Ordering::Relaxed) % scale == scale - 1
    }

    /// Synthetic failure of the open submission itself.
    pub(crate) fn open_submit(&self) -> Option<RemoteStatus> {
        Self::fire(&self.open_submit_scaler, &self.open_submit_counter).then(|| {
            RemoteStatus::error(StatusCode::ConnectionError, "fuzz: open submission dropped")
        })
    }

    /// Overrides a successful open response with a transient failure.
    pub(crate) fn open_return(&self, status: RemoteStatus) -> RemoteStatus {
        if status.is_ok() && Self::fire(&self.open_return_scaler, &self.open_return_counter) {
            return RemoteStatus::error(StatusCode::SocketTimeout, "fuzz: open response dropped");
        }
        status
    }

    /// Overrides a successful read response with an I/O failure.
    pub(crate) fn read_return(&self, status: RemoteStatus) -> RemoteStatus {
        if status.is_ok() && Self::fire(&self.read_return_scaler, &self.read_return_counter) {
            return RemoteStatus::error(StatusCode::IoError, "fuzz: read response dropped");
        }
        status
    }
}
