use anyhow::Context;
use btleplug::api::BDAddr;
use clap::{Parser, Subcommand};
use tracing::info;

use linak_desk::domain::settings::SettingsService;
use linak_desk::infrastructure::bluetooth::default_adapter;
use linak_desk::infrastructure::logging;
use linak_desk::LinakDesk;

#[derive(Parser)]
#[command(name = "linak-desk", about = "Control a Linak DPG standing desk over Bluetooth LE")]
struct Cli {
    /// Desk address (AA:BB:CC:DD:EE:FF); defaults to the last one used
    #[arg(short, long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print name, offset, favorites and current height
    Status,
    /// Print the current height
    Height,
    /// Move to an absolute height in centimeters
    MoveTo { cm: f32 },
    /// Move to the highest position
    Up,
    /// Move to the lowest position
    Down,
    /// Move to a stored favorite position
    Fav { slot: u8 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = SettingsService::new()?;
    let _logging = logging::init_logger(&settings.get().log_settings)?;

    let address = cli
        .address
        .or_else(|| settings.get().last_connected_address.clone())
        .context("no desk address given and none remembered")?;
    let parsed = BDAddr::from_str_delim(&address)
        .with_context(|| format!("invalid Bluetooth address: {address}"))?;

    let adapter = default_adapter().await?;
    let desk = LinakDesk::new(adapter, parsed);

    info!(%address, "connecting to the desk");
    desk.init().await?;
    settings.remember_address(&address)?;

    let result = run(&desk, cli.command).await;

    desk.disconnect().await?;
    result
}

async fn run(desk: &LinakDesk, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => println!("{}", desk.summary().await?),
        Command::Height => println!("{}", desk.current_height_with_offset().await?),
        Command::MoveTo { cm } => {
            desk.move_to_cm(cm).await?;
            desk.wait_for_stop().await;
        }
        Command::Up => {
            desk.move_up().await?;
            desk.wait_for_stop().await;
        }
        Command::Down => {
            desk.move_down().await?;
            desk.wait_for_stop().await;
        }
        Command::Fav { slot } => {
            desk.move_to_favorite(slot).await?;
            desk.wait_for_stop().await;
        }
    }
    Ok(())
}
