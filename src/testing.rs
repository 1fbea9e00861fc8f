//! In-memory [`DeskLink`] for unit tests: records every transport call
//! and serves scripted characteristic reads.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LinkError;
use crate::infrastructure::bluetooth::connection::DeskLink;
use crate::infrastructure::bluetooth::protocol::DeskCharacteristic;

#[derive(Default)]
pub struct FakeLink {
    writes: Mutex<Vec<(DeskCharacteristic, Vec<u8>, bool)>>,
    reads: Mutex<VecDeque<Vec<u8>>>,
    default_read: Mutex<Option<Vec<u8>>>,
    reads_before_failure: Mutex<Option<u32>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot read result for the next `read` call.
    pub fn push_read(&self, payload: Vec<u8>) {
        self.reads.lock().unwrap().push_back(payload);
    }

    /// Payload served once the queued reads are exhausted.
    pub fn set_default_read(&self, payload: Vec<u8>) {
        *self.default_read.lock().unwrap() = Some(payload);
    }

    /// Let `count` reads succeed, then fail every read after that.
    pub fn fail_reads_after(&self, count: u32) {
        *self.reads_before_failure.lock().unwrap() = Some(count);
    }

    pub fn writes(&self) -> Vec<(DeskCharacteristic, Vec<u8>, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, target: DeskCharacteristic) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(characteristic, _, _)| *characteristic == target)
            .map(|(_, payload, _)| payload)
            .collect()
    }
}

#[async_trait]
impl DeskLink for FakeLink {
    async fn connect(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn write(
        &self,
        target: DeskCharacteristic,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), LinkError> {
        self.writes
            .lock()
            .unwrap()
            .push((target, payload.to_vec(), with_response));
        Ok(())
    }

    async fn read(&self, target: DeskCharacteristic) -> Result<Vec<u8>, LinkError> {
        if let Some(remaining) = self.reads_before_failure.lock().unwrap().as_mut() {
            if *remaining == 0 {
                return Err(LinkError::NotConnected);
            }
            *remaining -= 1;
        }
        if let Some(payload) = self.reads.lock().unwrap().pop_front() {
            return Ok(payload);
        }
        self.default_read
            .lock()
            .unwrap()
            .clone()
            .ok_or(LinkError::CharacteristicNotFound(target.name()))
    }
}
