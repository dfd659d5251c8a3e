use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cadence::client::{TalkOptions, talk};
use cadence::voice::{
    AudioCapture, AudioPlayback, Decoded, PLAYBACK_SAMPLE_RATE, PlaybackQueue, TextToSpeech,
    level_dbfs,
};
use cadence::{Config, Daemon};

/// Cadence - Real-time voice conversations with an AI assistant
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice server (default)
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to a running server through the microphone and speakers
    Talk {
        /// User id reported to the server
        #[arg(short, long, env = "CADENCE_USER_ID")]
        user: Option<String>,
        /// Server WebSocket URL (overrides config)
        #[arg(long)]
        url: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,cadence=info",
        1 => "info,cadence=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Serve { port: None });

    match command {
        Command::Serve { port } => serve(port).await,
        Command::Talk { user, url } => run_talk(user, url).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&text).await,
    }
}

/// Run the voice server until interrupted
async fn serve(port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port {
        config.server.port = port;
    }
    tracing::debug!(?config.voice, ?config.session, "loaded configuration");

    tracing::info!(port = config.server.port, "starting cadence server");
    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}

/// Run the terminal voice client
#[allow(clippy::future_not_send)]
async fn run_talk(user: Option<String>, url: Option<String>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let mut options = TalkOptions::from_config(&config, user);
    if let Some(url) = url {
        options.server_url = url;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    println!("Talking to {} (Enter stops or restarts, Ctrl-C quits)", options.server_url);
    talk::run(options, shutdown).await?;
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    let (frames_tx, mut frames) = mpsc::channel::<Vec<f32>>(256);
    capture.start(frames_tx)?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        let mut second = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames.recv()).await {
            second.extend(frame);
        }

        let level = level_dbfs(&second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter, -60 dBFS to 0 dBFS
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = ((level.max(-60.0) + 60.0) / 60.0 * 50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len.min(50));

        println!(
            "[{:2}s] Level: {:6.1} dBFS | Peak: {:.4} | [{}]",
            i + 1,
            level,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near -inf, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = AudioPlayback::new(PlaybackQueue::new())?;

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), PLAYBACK_SAMPLE_RATE);

    playback.enqueue(&Decoded {
        samples,
        sample_rate: PLAYBACK_SAMPLE_RATE,
    });
    playback.flush();
    while !playback.is_drained() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output with the configured provider
#[allow(clippy::future_not_send)]
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let voice = &config.voice;
    let tts = match voice.tts_provider {
        cadence::config::TtsProvider::OpenAi => TextToSpeech::new_openai(
            config
                .api_keys
                .openai
                .clone()
                .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?,
            voice.tts_voice.clone(),
            voice.tts_speed,
            voice.tts_model.clone(),
        )?,
        cadence::config::TtsProvider::ElevenLabs => TextToSpeech::new_elevenlabs(
            config
                .api_keys
                .elevenlabs
                .clone()
                .ok_or_else(|| anyhow::anyhow!("ELEVENLABS_API_KEY is not set"))?,
            voice.tts_voice.clone(),
            voice.tts_model.clone(),
        )?,
    };

    println!("Synthesizing speech...");
    let mp3_data = tts.synthesize_all(text).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    // Check MP3 header
    if mp3_data.len() > 3 {
        println!(
            "First 4 bytes: {:02x} {:02x} {:02x} {:02x}",
            mp3_data[0], mp3_data[1], mp3_data[2], mp3_data[3]
        );
    }

    println!("Playing audio...");
    let mut playback = AudioPlayback::new(PlaybackQueue::new())?;
    playback.play_mp3(&mp3_data).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
