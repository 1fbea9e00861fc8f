//! Public desk API.
//!
//! [`LinakDesk`] ties the pieces together: it owns the link, the
//! notification-populated state and the movement controller, and
//! serializes query rounds behind one advisory lock (the DPG protocol
//! cannot multiplex overlapping rounds).

use std::sync::Arc;

use btleplug::api::BDAddr;
use btleplug::platform::Adapter;
use tracing::debug;

use crate::domain::movement::MovementController;
use crate::domain::position::DeskPosition;
use crate::domain::state::DeskState;
use crate::error::DeskError;
use crate::infrastructure::bluetooth::connection::{
    BtleConnection, DeskLink, NotificationRegistry,
};
use crate::infrastructure::bluetooth::protocol::{
    self, DeskCharacteristic, PROP_DESK_OFFSET, PROP_GET_CAPABILITIES, PROP_MEMORY_POSITION_1,
    PROP_MEMORY_POSITION_2, PROP_USER_ID,
};

/// Travel range relative to the desk offset, in centimeters.
pub const HEIGHT_MIN_CM: f32 = 0.0;
pub const HEIGHT_MAX_CM: f32 = 64.0;

/// One Linak DPG desk.
pub struct LinakDesk {
    link: Arc<dyn DeskLink>,
    state: Arc<DeskState>,
    movement: Arc<MovementController>,
    // Query rounds and move admission must not interleave.
    op_lock: tokio::sync::Mutex<()>,
}

impl LinakDesk {
    /// Build a desk over the system BLE stack. The notification
    /// registry is recorded here once and re-applied on every
    /// (re)connect.
    pub fn new(adapter: Adapter, address: BDAddr) -> Self {
        let state = Arc::new(DeskState::new());

        let mut registry = NotificationRegistry::new();
        {
            let state = state.clone();
            registry.register(
                DeskCharacteristic::ReferenceOutput,
                Arc::new(move |payload| state.handle_reference_notification(payload)),
            );
        }
        {
            let state = state.clone();
            registry.register(
                DeskCharacteristic::DpgCommand,
                Arc::new(move |payload| state.handle_dpg_notification(payload)),
            );
        }

        let link: Arc<dyn DeskLink> =
            Arc::new(BtleConnection::new(adapter, address, registry));
        Self::with_link(link, state)
    }

    /// Build a desk over an arbitrary link. The caller is responsible
    /// for routing notifications into `state`.
    pub fn with_link(link: Arc<dyn DeskLink>, state: Arc<DeskState>) -> Self {
        let movement = MovementController::new(link.clone(), state.clone());
        Self {
            link,
            state,
            movement,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect and run the full query sequence: identity, desk offset,
    /// favorite positions, height/speed.
    pub async fn init(&self) -> Result<(), DeskError> {
        let _round = self.op_lock.lock().await;
        debug!("querying the device");

        self.link.connect().await?;
        self.query_initial_data().await?;
        self.query_desk_offset().await?;
        self.query_memory_positions().await?;
        self.query_height_speed().await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), DeskError> {
        self.movement.stop();
        self.link.disconnect().await?;
        Ok(())
    }

    // The device does not answer DPG queries until its name has been
    // read; the UserId and Capabilities replies are not consumed into
    // named fields but must be drained before the next round.
    async fn query_initial_data(&self) -> Result<(), DeskError> {
        let raw_name = self.link.read(DeskCharacteristic::DeviceName).await?;
        self.state
            .name
            .set(String::from_utf8_lossy(&raw_name).into_owned());

        self.link.dpg_command(PROP_USER_ID).await?;
        self.link.dpg_command(PROP_GET_CAPABILITIES).await?;
        Ok(())
    }

    async fn query_desk_offset(&self) -> Result<(), DeskError> {
        self.link.dpg_command(PROP_DESK_OFFSET).await?;
        Ok(())
    }

    // Both favorite replies carry the same command type, so the round
    // is clear-then-fill: query slot 1, wait for it, then slot 2.
    async fn query_memory_positions(&self) -> Result<(), DeskError> {
        self.state.favorite_1.clear();
        self.state.favorite_2.clear();

        self.link.dpg_command(PROP_MEMORY_POSITION_1).await?;
        self.state.favorite_1.wait().await?;

        self.link.dpg_command(PROP_MEMORY_POSITION_2).await?;
        self.state.favorite_2.wait().await?;
        Ok(())
    }

    async fn query_height_speed(&self) -> Result<(), DeskError> {
        let payload = self.link.read(DeskCharacteristic::ReferenceOutput).await?;
        let sample = protocol::decode_height_speed(&payload)?;
        self.state.height_speed.set(sample);
        Ok(())
    }

    pub async fn name(&self) -> Result<String, DeskError> {
        Ok(self.state.name.wait().await?)
    }

    pub async fn desk_offset(&self) -> Result<DeskPosition, DeskError> {
        Ok(self.state.desk_offset.wait().await?)
    }

    pub async fn favorite_position_1(&self) -> Result<DeskPosition, DeskError> {
        Ok(self.state.favorite_1.wait().await?)
    }

    pub async fn favorite_position_2(&self) -> Result<DeskPosition, DeskError> {
        Ok(self.state.favorite_2.wait().await?)
    }

    /// Latest raw height. Re-reads telemetry first unless a movement is
    /// keeping it fresh already.
    pub async fn current_height(&self) -> Result<DeskPosition, DeskError> {
        if !self.movement.is_running() {
            let _round = self.op_lock.lock().await;
            self.query_height_speed().await?;
        }
        Ok(self.state.height_speed.wait().await?.height)
    }

    /// Current height with the persisted desk offset applied.
    pub async fn current_height_with_offset(&self) -> Result<DeskPosition, DeskError> {
        let offset = self.desk_offset().await?;
        Ok(self.current_height().await?.with_offset(offset))
    }

    pub fn is_running(&self) -> bool {
        self.movement.is_running()
    }

    /// `(target_cm, direction_up)` of the active move, if any.
    pub fn target_height(&self) -> (Option<f32>, Option<bool>) {
        self.movement.target_height()
    }

    /// Move to an absolute height in centimeters (offset included).
    pub async fn move_to_cm(&self, cm: f32) -> Result<(), DeskError> {
        self.move_relative_cm(cm, false).await
    }

    pub async fn move_up(&self) -> Result<(), DeskError> {
        let offset = self.desk_offset().await?;
        self.move_relative_cm(offset.cm() + HEIGHT_MAX_CM, true).await
    }

    pub async fn move_down(&self) -> Result<(), DeskError> {
        let offset = self.desk_offset().await?;
        self.move_relative_cm(offset.cm() + HEIGHT_MIN_CM, true).await
    }

    pub async fn move_to_favorite(&self, slot: u8) -> Result<(), DeskError> {
        let target = match slot {
            1 => self.state.favorite_1.wait().await?,
            2 => self.state.favorite_2.wait().await?,
            other => return Err(DeskError::InvalidFavoriteSlot(other)),
        };

        let _admission = self.op_lock.lock().await;
        self.movement.move_to(target, false).await
    }

    pub fn stop(&self) {
        self.movement.stop();
    }

    /// Block until the active movement (if any) has finished.
    pub async fn wait_for_stop(&self) {
        while self.movement.is_running() {
            tokio::time::sleep(crate::domain::state::WAIT_INTERVAL).await;
        }
    }

    async fn move_relative_cm(&self, cm: f32, manual: bool) -> Result<(), DeskError> {
        let offset = self.desk_offset().await?;
        let target = DeskPosition::from_cm(cm - offset.cm());

        let _admission = self.op_lock.lock().await;
        self.movement.move_to(target, manual).await
    }

    /// Human-readable summary of everything the desk reported.
    pub async fn summary(&self) -> Result<String, DeskError> {
        let offset = self.desk_offset().await?;
        Ok(format!(
            "Desk offset: {}, name: {}\nFav position 1: {}, Fav position 2: {}, Height with offset: {}",
            offset.human_cm(),
            self.name().await?,
            self.favorite_position_1().await?.with_offset(offset).human_cm(),
            self.favorite_position_2().await?.with_offset(offset).human_cm(),
            self.current_height_with_offset().await?.human_cm(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{HeightSpeed, Speed};
    use crate::testing::FakeLink;

    fn desk_with(link: Arc<FakeLink>) -> LinakDesk {
        let state = Arc::new(DeskState::new());
        state.desk_offset.set(DeskPosition::new(6210));
        state.favorite_1.set(DeskPosition::new(300));
        state.favorite_2.set(DeskPosition::new(4000));
        state.height_speed.set(HeightSpeed {
            height: DeskPosition::new(300),
            speed: Speed::new(0),
        });
        LinakDesk::with_link(link, state)
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_favorite_slot_issues_no_transport_calls() {
        let link = Arc::new(FakeLink::new());
        let desk = desk_with(link.clone());

        let err = desk.move_to_favorite(3).await.unwrap_err();
        assert!(matches!(err, DeskError::InvalidFavoriteSlot(3)));
        assert!(link.writes().is_empty());

        let err = desk.move_to_favorite(0).await.unwrap_err();
        assert!(matches!(err, DeskError::InvalidFavoriteSlot(0)));
        assert!(link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn move_to_cm_targets_relative_to_offset() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(vec![0x2C, 0x01, 0x00, 0x00]);
        let desk = desk_with(link.clone());

        // 80 cm absolute, offset 62.1 cm -> raw target 1790.
        desk.move_to_cm(80.0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let moves = link.writes_to(DeskCharacteristic::MoveTo);
        assert!(!moves.is_empty());
        assert_eq!(moves[0], DeskPosition::new(1790).to_bytes().to_vec());
        desk.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn move_to_favorite_targets_the_stored_position() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(vec![0x2C, 0x01, 0x00, 0x00]);
        let desk = desk_with(link.clone());

        desk.move_to_favorite(2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let moves = link.writes_to(DeskCharacteristic::MoveTo);
        assert_eq!(moves[0], DeskPosition::new(4000).to_bytes().to_vec());
        desk.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn current_height_refreshes_when_idle() {
        let link = Arc::new(FakeLink::new());
        link.set_default_read(vec![0x0A, 0x00, 0x00, 0x00]);
        let desk = desk_with(link.clone());

        let height = desk.current_height().await.unwrap();
        assert_eq!(height.raw(), 10);

        let with_offset = desk.current_height_with_offset().await.unwrap();
        assert_eq!(with_offset.raw(), 6220);
    }

    #[tokio::test(start_paused = true)]
    async fn init_runs_the_full_query_sequence() {
        let link = Arc::new(FakeLink::new());
        let state = Arc::new(DeskState::new());
        let desk = LinakDesk::with_link(link.clone(), state.clone());

        // Replies the transport would deliver via notifications.
        link.push_read(b"DESK 6462".to_vec());
        link.set_default_read(vec![0x2C, 0x01, 0x00, 0x00]);
        state.desk_offset.set(DeskPosition::new(6210));

        let init = desk.init();
        let feed = async {
            // Favorites arrive while init waits on the cells.
            tokio::time::sleep(std::time::Duration::from_millis(800)).await;
            state.handle_dpg_notification(&[0x01, 0x07, 0x2C, 0x01]);
            tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            state.handle_dpg_notification(&[0x01, 0x07, 0xA0, 0x0F]);
        };
        let (result, _) = tokio::join!(init, feed);
        result.unwrap();

        assert_eq!(desk.name().await.unwrap(), "DESK 6462");
        assert_eq!(
            desk.favorite_position_1().await.unwrap(),
            DeskPosition::new(300)
        );
        assert_eq!(
            desk.favorite_position_2().await.unwrap(),
            DeskPosition::new(4000)
        );

        // Initial round: user id, capabilities, offset, two favorites.
        let queries = link.writes_to(DeskCharacteristic::DpgCommand);
        assert_eq!(
            queries,
            vec![
                protocol::encode_query(PROP_USER_ID).to_vec(),
                protocol::encode_query(PROP_GET_CAPABILITIES).to_vec(),
                protocol::encode_query(PROP_DESK_OFFSET).to_vec(),
                protocol::encode_query(PROP_MEMORY_POSITION_1).to_vec(),
                protocol::encode_query(PROP_MEMORY_POSITION_2).to_vec(),
            ]
        );
    }
}
