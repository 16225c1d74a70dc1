use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::info;
use pcm_stream::{
    load_config, AudioDevice, BlockFormat, ConfigLayer, CpalConfig, CpalDevice, Supervisor,
    WavDevice, WavDeviceConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceKind {
    /// Host sound card
    Cpal,
    /// WAV file as microphone, WAV file as speaker
    Wav,
}

#[derive(Parser, Debug)]
#[command(name = "pcm-stream")]
#[command(about = "Stream microphone audio to the bridge and play back what it sends")]
struct Args {
    /// Bridge host (overrides PCM_STREAM_HOST and the config file)
    #[arg(long)]
    host: Option<String>,

    /// Bridge port (overrides PCM_STREAM_PORT and the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Audio device backing capture and playback
    #[arg(short, long, value_enum, default_value = "cpal")]
    device: DeviceKind,

    /// Capture input device name (cpal)
    #[arg(long)]
    input_device: Option<String>,

    /// Playback output device name (cpal)
    #[arg(long)]
    output_device: Option<String>,

    /// 16-bit WAV file used as the microphone (wav)
    #[arg(long, required_if_eq("device", "wav"))]
    input_wav: Option<PathBuf>,

    /// Where to record received audio (wav)
    #[arg(long)]
    output_wav: Option<PathBuf>,

    /// Sample rate of the audio exchanged with the bridge
    #[arg(long, default_value = "24000")]
    stream_rate: u32,

    /// Channel count of the audio exchanged with the bridge
    #[arg(long, default_value = "1")]
    stream_channels: u16,

    /// Delay between connect attempts in milliseconds
    #[arg(long)]
    connect_retry_ms: Option<u64>,

    /// Back off exponentially up to this many milliseconds
    #[arg(long)]
    max_connect_retry_ms: Option<u64>,

    /// Delay after a dropped connection in milliseconds
    #[arg(long)]
    close_delay_ms: Option<u64>,

    /// Capture poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

impl Args {
    fn config_layer(&self) -> ConfigLayer {
        ConfigLayer {
            host: self.host.clone(),
            port: self.port,
            connect_retry_ms: self.connect_retry_ms,
            max_connect_retry_ms: self.max_connect_retry_ms,
            close_delay_ms: self.close_delay_ms,
            poll_interval_ms: self.poll_interval_ms,
        }
    }

    fn stream_format(&self) -> BlockFormat {
        BlockFormat::new(self.stream_rate, self.stream_channels)
    }

    fn open_device(&self) -> anyhow::Result<Arc<dyn AudioDevice>> {
        let device: Arc<dyn AudioDevice> = match self.device {
            DeviceKind::Cpal => {
                let device = CpalDevice::open(CpalConfig {
                    input_device: self.input_device.clone(),
                    output_device: self.output_device.clone(),
                    stream_format: self.stream_format(),
                    ..CpalConfig::default()
                })
                .context("Failed to open sound card")?;
                info!(
                    "🔊 Sound card capture {}, playback {}",
                    device.capture_format(),
                    device.output_format()
                );
                Arc::new(device)
            }
            DeviceKind::Wav => {
                let input = self
                    .input_wav
                    .clone()
                    .context("--input-wav is required with --device wav")?;
                Arc::new(
                    WavDevice::open(WavDeviceConfig {
                        input,
                        output: self.output_wav.clone(),
                        output_format: self.stream_format(),
                        realtime: true,
                    })
                    .context("Failed to open WAV device")?,
                )
            }
        };
        Ok(device)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    info!("🚀 Starting pcm-stream with args: {:?}", args);

    let config = load_config(args.config.as_deref(), args.config_layer())?;
    let device = args.open_device()?;
    let supervisor = Supervisor::new(config, device).context("Capture format cannot be streamed")?;

    supervisor.run()
}
