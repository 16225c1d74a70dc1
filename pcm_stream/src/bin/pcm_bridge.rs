use clap::Parser;
use log::info;
use pcm_stream::{BlockFormat, BridgeConfig, BridgeServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pcm-bridge")]
#[command(about = "Accept a board's uplink and downlink connections")]
struct Args {
    /// Address to bind the TCP server to
    #[arg(short, long, default_value = "0.0.0.0:9002")]
    address: String,

    /// Play every uplink block straight back to the board
    #[arg(long)]
    loopback: bool,

    /// Record uplink audio to a WAV file
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Uplink sample rate, for the recording header
    #[arg(long, default_value = "24000")]
    sample_rate: u32,

    /// Uplink channel count, for the recording header
    #[arg(long, default_value = "1")]
    channels: u16,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    info!("🚀 Starting pcm-bridge with args: {:?}", args);

    let mut server = BridgeServer::new(BridgeConfig {
        bind_address: args.address,
        loopback: args.loopback,
        record: args.record,
        record_format: BlockFormat::new(args.sample_rate, args.channels),
    })?;

    // Handle Ctrl+C gracefully
    let should_stop = Arc::new(AtomicBool::new(false));
    let should_stop_clone = Arc::clone(&should_stop);
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        should_stop_clone.store(true, Ordering::Relaxed);
    })?;

    let port = server.start()?;
    info!("🎵 Bridge started on port {}", port);

    while !should_stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    server.stop();
    info!("🛑 Bridge stopped");

    Ok(())
}
