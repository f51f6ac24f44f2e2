mod api;

use clap::{Parser, Subcommand};
use fxsline_core::dtmf::DetectorConfig;
use fxsline_core::error::ConfigError;
use fxsline_core::tone::ToneGenerator;
use fxsline_core::{DtmfDetector, DtmfDigit, HardwareSupervisor, LineConfig, LineError, SimulatedLine};
use hound::WavSpec;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fxsline")]
#[command(about = "FXS line control: DTMF detection, ring sequencing and line supervision")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP/WebSocket API over a simulated line
    Serve {
        /// JSON line configuration file
        #[arg(short, long, value_name = "CONFIG.JSON")]
        config: Option<PathBuf>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Hardware channel number
        #[arg(long)]
        channel: Option<u32>,

        /// DTMF detection threshold in dBm
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,

        /// Minimum tone duration in milliseconds
        #[arg(long)]
        min_duration: Option<u32>,
    },

    /// Run the DTMF detector over a WAV file
    Detect {
        /// Input WAV file (16-bit PCM)
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// JSON line configuration file
        #[arg(short, long, value_name = "CONFIG.JSON")]
        config: Option<PathBuf>,

        /// DTMF detection threshold in dBm
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,
    },

    /// Synthesize a DTMF digit string into a WAV file
    Generate {
        /// Digits to dial (0-9, *, #, A-D)
        digits: String,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Tone length per digit
        #[arg(long, default_value = "100")]
        tone_ms: u32,

        /// Silence between digits
        #[arg(long, default_value = "100")]
        gap_ms: u32,

        #[arg(long, default_value = "8000")]
        sample_rate: u32,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Line(#[from] LineError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported WAV format: {0}")]
    UnsupportedWav(String),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            channel,
            threshold,
            min_duration,
        } => {
            let mut line_config = load_config(config.as_deref())?;
            if let Some(channel) = channel {
                line_config.channel = channel;
            }
            if let Some(threshold) = threshold {
                line_config.detection_threshold_dbm = threshold;
            }
            if let Some(min_duration) = min_duration {
                line_config.min_tone_duration_ms = min_duration;
            }
            line_config.validate()?;
            serve_command(line_config, &host, port).await?
        }
        Commands::Detect {
            input,
            config,
            threshold,
        } => {
            let mut line_config = load_config(config.as_deref())?;
            if let Some(threshold) = threshold {
                line_config.detection_threshold_dbm = threshold;
            }
            detect_command(&input, line_config)?
        }
        Commands::Generate {
            digits,
            output,
            tone_ms,
            gap_ms,
            sample_rate,
        } => generate_command(&digits, &output, tone_ms, gap_ms, sample_rate)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<LineConfig, CliError> {
    let Some(path) = path else {
        return Ok(LineConfig::default());
    };
    let text = std::fs::read_to_string(path)?;
    let config: LineConfig = serde_json::from_str(&text)?;
    info!("Loaded line configuration from {}", path.display());
    Ok(config)
}

async fn serve_command(config: LineConfig, host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let sim = Arc::new(SimulatedLine::new(0.0));
    let line = HardwareSupervisor::new(config, sim.clone())?;
    line.start().await?;

    let app = api::router(api::AppState {
        line: line.clone(),
        sim,
    });

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    line.shutdown().await;
    Ok(())
}

fn detect_command(input_path: &Path, mut config: LineConfig) -> Result<(), CliError> {
    let file = File::open(input_path)?;
    let mut reader = hound::WavReader::new(file)?;

    let spec = reader.spec();
    println!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(CliError::UnsupportedWav(format!(
            "{} bit {:?} (need 16-bit PCM)",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    // First channel only
    let channels = spec.channels.max(1) as usize;
    let interleaved: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    let samples: Vec<i16> = interleaved?.into_iter().step_by(channels).collect();
    println!("Extracted {} samples", samples.len());

    config.sample_rate = spec.sample_rate;
    config.validate()?;

    let events = detect_digits(&samples, DetectorConfig::from(&config));
    for (offset_ms, event) in &events {
        println!(
            "{:>8} ms  {}  ({} ms, {:.1} dBm)",
            offset_ms, event.digit, event.duration_ms, event.signal_level_dbm
        );
    }
    let digits: String = events.iter().map(|(_, e)| e.digit.as_char()).collect();
    println!("Detected {} digits: {}", digits.len(), digits);

    Ok(())
}

/// Feed whole frames through a detector, pairing each event with the
/// offset of the frame that completed it.
fn detect_digits(samples: &[i16], config: DetectorConfig) -> Vec<(u64, fxsline_core::DtmfEvent)> {
    let frame_ms = config.frame_size as u64 * 1000 / config.sample_rate as u64;
    let mut detector = DtmfDetector::new(config);
    let mut events = Vec::new();

    for (index, frame) in samples.chunks_exact(config.frame_size).enumerate() {
        if let Ok(Some(event)) = detector.process_frame(frame) {
            events.push((index as u64 * frame_ms, event));
        }
    }
    events
}

fn generate_command(
    digits: &str,
    output_path: &Path,
    tone_ms: u32,
    gap_ms: u32,
    sample_rate: u32,
) -> Result<(), CliError> {
    let digits = DtmfDigit::parse_sequence(digits).map_err(LineError::from)?;
    let samples = ToneGenerator::new(sample_rate).digits(&digits, tone_ms, gap_ms)?;
    println!("Synthesized {} digits into {} samples", digits.len(), samples.len());

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let file = File::create(output_path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    println!("Wrote {}", output_path.display());
    Ok(())
}
