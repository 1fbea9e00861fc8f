pub mod movement;
pub mod position;
pub mod settings;
pub mod state;
