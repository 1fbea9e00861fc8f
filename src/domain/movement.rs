//! Closed-loop movement controller.
//!
//! One movement may be active per desk. The controller repeatedly sends
//! the target to the reference-input characteristic, re-samples the
//! height/speed telemetry and stops on arrival/stall, explicit stop or
//! the hard cutoff. The atomic running flag together with a per-move
//! epoch is the sole gate for the polling loop; every blocking step
//! re-checks it so `stop()` has bounded latency.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::position::DeskPosition;
use crate::domain::state::DeskState;
use crate::error::DeskError;
use crate::infrastructure::bluetooth::connection::DeskLink;
use crate::infrastructure::bluetooth::protocol::{self, DeskCharacteristic};

/// Below this raw delta the device cannot reliably home in on the
/// target, so a move request becomes a no-op.
pub const MIN_MOVE_DELTA: i32 = 10;

/// Hard ceiling on any single movement.
pub const MOVE_CUTOFF: Duration = Duration::from_secs(30);

/// Pause between actuation command and the next telemetry sample.
pub const MOVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct ActiveMove {
    target: DeskPosition,
    manual: bool,
    started_at: Instant,
    cutoff: Option<JoinHandle<()>>,
}

/// Movement state machine: Idle, or one active move.
pub struct MovementController {
    link: Arc<dyn DeskLink>,
    state: Arc<DeskState>,
    running: AtomicBool,
    // Bumped on every new move so a superseded polling loop exits even
    // if it observes the flag raised again for the successor.
    epoch: AtomicU64,
    active: Mutex<Option<ActiveMove>>,
}

impl MovementController {
    pub fn new(link: Arc<dyn DeskLink>, state: Arc<DeskState>) -> Arc<Self> {
        Arc::new(Self {
            link,
            state,
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            active: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start moving toward `target`. A new request supersedes any move
    /// already in flight. Sub-threshold deltas are a no-op and issue no
    /// actuation command.
    pub async fn move_to(
        self: &Arc<Self>,
        target: DeskPosition,
        manual: bool,
    ) -> Result<(), DeskError> {
        if self.is_running() {
            self.stop();
        }

        let current = self.state.height_speed.wait().await?.height;
        if (target.raw() - current.raw()).abs() < MIN_MOVE_DELTA {
            debug!(current = %current, target = %target, "move not possible, delta below threshold");
            return Ok(());
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.running.store(true, Ordering::SeqCst);

        let cutoff = {
            let controller = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MOVE_CUTOFF).await;
                if controller.live(epoch) {
                    debug!("move cutoff reached, stopping");
                    controller.stop();
                }
            })
        };

        *self.active.lock().unwrap() = Some(ActiveMove {
            target,
            manual,
            started_at: Instant::now(),
            cutoff: Some(cutoff),
        });

        debug!(target = %target, manual, "starting move");
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_loop(epoch, target).await;
        });

        Ok(())
    }

    /// Transition to Idle. Idempotent; cancels the cutoff timer and
    /// clears the manual-change marker.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(mut finished) = self.active.lock().unwrap().take() {
            if let Some(cutoff) = finished.cutoff.take() {
                cutoff.abort();
            }
            if was_running {
                debug!(
                    target = %finished.target,
                    elapsed_ms = finished.started_at.elapsed().as_millis() as u64,
                    "move stopped"
                );
            }
        }
    }

    /// `(target_cm, direction_up)` of the active move. Idle reports
    /// `(None, None)`; manual moves run open-loop toward an extreme and
    /// report only their direction.
    pub fn target_height(&self) -> (Option<f32>, Option<bool>) {
        if !self.is_running() {
            return (None, None);
        }
        let active = self.active.lock().unwrap();
        let (Some(current), Some(active)) = (self.state.height_speed.get(), active.as_ref()) else {
            return (None, None);
        };

        let direction_up = active.target.raw() > current.height.raw();
        if active.manual {
            (None, Some(direction_up))
        } else {
            (Some(active.target.cm()), Some(direction_up))
        }
    }

    fn live(&self, epoch: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn run_loop(&self, epoch: u64, target: DeskPosition) {
        while self.live(epoch) {
            if let Err(error) = self.step(epoch, target).await {
                warn!(%error, "movement step failed, stopping");
                self.stop();
            }
        }
    }

    async fn step(&self, epoch: u64, target: DeskPosition) -> Result<(), DeskError> {
        // Acknowledged write, but no reply is waited for; the loop just
        // re-samples telemetry.
        self.link
            .write(DeskCharacteristic::MoveTo, &target.to_bytes(), true)
            .await?;

        tokio::time::sleep(MOVE_POLL_INTERVAL).await;
        if !self.live(epoch) {
            return Ok(());
        }

        let payload = self.link.read(DeskCharacteristic::ReferenceOutput).await?;
        let sample = protocol::decode_height_speed(&payload)?;
        self.state.height_speed.set(sample);

        if sample.speed.is_stopped() {
            debug!(height = %sample.height, "desk stopped moving");
            self.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::HeightSpeed;
    use crate::domain::position::Speed;
    use crate::testing::FakeLink;

    const MOVING: [u8; 4] = [0x10, 0x27, 0x90, 0x01];
    const STOPPED: [u8; 4] = [0x10, 0x27, 0x00, 0x00];

    fn controller_with(link: Arc<FakeLink>, height_raw: i32) -> Arc<MovementController> {
        let state = Arc::new(DeskState::new());
        state.height_speed.set(HeightSpeed {
            height: DeskPosition::new(height_raw),
            speed: Speed::new(0),
        });
        MovementController::new(link, state)
    }

    #[tokio::test(start_paused = true)]
    async fn sub_threshold_move_is_a_no_op() {
        let link = Arc::new(FakeLink::new());
        let controller = controller_with(link.clone(), 100);

        controller.move_to(DeskPosition::new(105), false).await.unwrap();

        assert!(!controller.is_running());
        assert!(link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stall_stops_the_move() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(STOPPED.to_vec());
        let controller = controller_with(link.clone(), 100);

        controller.move_to(DeskPosition::new(500), false).await.unwrap();
        assert!(controller.is_running());

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!controller.is_running());
        let writes = link.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, DeskCharacteristic::MoveTo);
        assert_eq!(writes[0].1, DeskPosition::new(500).to_bytes().to_vec());
        // The move command is a GATT acknowledged write; only the reply
        // wait is skipped.
        assert!(writes[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn cutoff_forces_idle() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(MOVING.to_vec());
        let controller = controller_with(link.clone(), 100);

        controller.move_to(DeskPosition::new(5000), false).await.unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(controller.is_running());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn new_move_supersedes_the_old_one() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(MOVING.to_vec());
        let controller = controller_with(link.clone(), 100);

        controller.move_to(DeskPosition::new(5000), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.move_to(DeskPosition::new(900), false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(controller.is_running());
        let (target_cm, _) = controller.target_height();
        assert_eq!(target_cm, Some(9.0));
        let writes = link.writes();
        assert_eq!(
            writes.last().unwrap().1,
            DeskPosition::new(900).to_bytes().to_vec()
        );

        controller.stop();
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_telemetry_read_stops_the_move() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(MOVING.to_vec());
        link.fail_reads_after(1);
        let controller = controller_with(link.clone(), 100);

        controller.move_to(DeskPosition::new(5000), false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn target_height_reports_direction() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(MOVING.to_vec());
        // Telemetry example: height raw 10, speed 0.
        let state = Arc::new(DeskState::new());
        state.handle_reference_notification(&[0x0A, 0x00, 0x00, 0x00]);
        let controller = MovementController::new(link.clone(), state);

        assert_eq!(controller.target_height(), (None, None));

        controller.move_to(DeskPosition::new(50), false).await.unwrap();
        let (target_cm, direction_up) = controller.target_height();
        assert_eq!(target_cm, Some(0.5));
        assert_eq!(direction_up, Some(true));
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_move_reports_no_target() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(MOVING.to_vec());
        let controller = controller_with(link.clone(), 6400);

        controller.move_to(DeskPosition::new(0), true).await.unwrap();
        let (target_cm, direction_up) = controller.target_height();
        assert_eq!(target_cm, None);
        assert_eq!(direction_up, Some(false));
        controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let link = Arc::new(FakeLink::new());
        let controller = controller_with(link, 100);
        controller.stop();
        controller.stop();
        assert!(!controller.is_running());
    }
}
