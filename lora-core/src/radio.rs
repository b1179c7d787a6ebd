//! Radio driver capability. The engine is generic over it; the host supplies the real one.

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("transmit timed out")]
    Timeout,
    #[error("radio closed")]
    Closed,
    #[error("radio i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DriverError::Timeout,
            _ => DriverError::Io(e.to_string()),
        }
    }
}

/// Half-duplex packet radio.
pub trait RadioDriver {
    /// Send one frame, waiting at most `timeout` for the transmission to finish.
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> Result<(), DriverError>;

    /// Copy the next received frame into `buf`. `Ok(None)` when nothing is waiting.
    /// Frames longer than `buf` are truncated to it.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DriverError>;
}

impl<T: RadioDriver + ?Sized> RadioDriver for &mut T {
    fn transmit(&mut self, frame: &[u8], timeout: Duration) -> Result<(), DriverError> {
        (**self).transmit(frame, timeout)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DriverError> {
        (**self).receive(buf)
    }
}

/// In-memory radio: records every transmitted frame and serves queued inbound frames.
#[derive(Debug, Default)]
pub struct LoopbackRadio {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    fail_with: Option<DriverError>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame as if it had just been received over the air.
    pub fn inject(&mut self, frame: impl Into<Vec<u8>>) {
        self.inbound.push_back(frame.into());
    }

    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Remove and return everything transmitted so far.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }

    /// Make every following transmit fail with `err` (None to recover).
    pub fn fail_transmit(&mut self, err: Option<DriverError>) {
        self.fail_with = err;
    }
}

impl RadioDriver for LoopbackRadio {
    fn transmit(&mut self, frame: &[u8], _timeout: Duration) -> Result<(), DriverError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DriverError> {
        let Some(frame) = self.inbound.pop_front() else {
            return Ok(None);
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(Some(n))
    }
}
