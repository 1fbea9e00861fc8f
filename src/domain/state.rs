//! Device-reported state, populated asynchronously by notifications.
//!
//! Every field starts unset and is written exactly once per query round
//! by the notification handlers. Readers bridge the asynchronous
//! population with [`StateCell::wait`], which polls the cell at a fixed
//! interval up to a hard ceiling instead of assuming immediate
//! consistency.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::position::{DeskPosition, HeightSpeed};
use crate::error::StateError;
use crate::infrastructure::bluetooth::protocol::{self, DpgCommand};

/// Poll interval for [`StateCell::wait`].
pub const WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Poll attempts before a wait gives up (100 x 200 ms = 20 s).
pub const WAIT_ATTEMPTS: u32 = 100;

/// A single-writer, many-reader cell holding one device-reported value.
pub struct StateCell<T> {
    name: &'static str,
    value: Mutex<Option<T>>,
}

impl<T: Clone> StateCell<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
    }

    pub fn clear(&self) {
        *self.value.lock().unwrap() = None;
    }

    /// Non-blocking snapshot; `None` while the value has not arrived.
    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap().clone()
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().unwrap().is_some()
    }

    /// Wait until the value arrives, polling every [`WAIT_INTERVAL`] up
    /// to [`WAIT_ATTEMPTS`] times.
    pub async fn wait(&self) -> Result<T, StateError> {
        self.wait_with(WAIT_INTERVAL, WAIT_ATTEMPTS).await
    }

    async fn wait_with(&self, interval: Duration, attempts: u32) -> Result<T, StateError> {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        for _ in 0..attempts {
            if let Some(value) = self.get() {
                return Ok(value);
            }
            tokio::time::sleep(interval).await;
        }
        Err(StateError::Timeout(self.name))
    }
}

/// Everything the desk has told us so far.
pub struct DeskState {
    pub name: StateCell<String>,
    pub desk_offset: StateCell<DeskPosition>,
    pub favorite_1: StateCell<DeskPosition>,
    pub favorite_2: StateCell<DeskPosition>,
    pub height_speed: StateCell<HeightSpeed>,
}

impl DeskState {
    pub fn new() -> Self {
        Self {
            name: StateCell::new("device name"),
            desk_offset: StateCell::new("desk offset"),
            favorite_1: StateCell::new("favorite position 1"),
            favorite_2: StateCell::new("favorite position 2"),
            height_speed: StateCell::new("height/speed"),
        }
    }

    /// Notification handler for the DPG characteristic. Decode failures
    /// are logged and dropped, they never abort an in-flight operation.
    pub fn handle_dpg_notification(&self, payload: &[u8]) {
        match protocol::decode_notification(payload) {
            Ok(command) => self.apply_dpg(command),
            Err(error) => warn!(%error, "dropping malformed DPG notification"),
        }
    }

    /// Notification handler for the reference-output characteristic.
    pub fn handle_reference_notification(&self, payload: &[u8]) {
        match protocol::decode_height_speed(payload) {
            Ok(sample) => {
                debug!(
                    height = %sample.height,
                    speed = sample.speed.magnitude(),
                    "telemetry sample"
                );
                self.height_speed.set(sample);
            }
            Err(error) => warn!(%error, "dropping malformed telemetry notification"),
        }
    }

    fn apply_dpg(&self, command: DpgCommand) {
        match command {
            DpgCommand::DeskOffset(offset) => {
                debug!(offset = %offset, "desk offset reply");
                self.desk_offset.set(offset);
            }
            // Both memory-position queries are answered with the same
            // reply code; the first reply after a round starts fills
            // slot 1, the second slot 2. Valid only while queries are
            // issued strictly sequentially with clear-then-fill.
            DpgCommand::MemoryPosition(position) => {
                if !self.favorite_1.is_set() {
                    self.favorite_1.set(position);
                } else if !self.favorite_2.is_set() {
                    self.favorite_2.set(position);
                } else {
                    warn!(position = %position, "extra memory position reply, dropping");
                }
            }
            DpgCommand::Ignored(code) => debug!(code, "ignoring DPG reply"),
        }
    }
}

impl Default for DeskState {
    fn default() -> Self {
        Self::new()
    }
}
