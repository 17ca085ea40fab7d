use clap::{Parser, Subcommand};
use council_voice::{
    audio_capture::CpalCapture,
    audio_sink::CpalOutput,
    config::{load_config, GenerationConfig, VoiceConfig},
    generation::{CouncilClient, CouncilRequest, MediaAttachment},
    history::{HistoryEntry, HistoryStore, DEFAULT_HISTORY_FILE},
    session::{LifecycleState, SessionController, SessionStatus},
    transport::LiveConnector,
    InteractionMode,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "council-voice", version, about = "Talk to the council")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a realtime voice session
    Voice {
        #[arg(long, default_value_t = InteractionMode::Collaborative)]
        mode: InteractionMode,
        /// Start with the microphone muted
        #[arg(long)]
        muted: bool,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        input_device: Option<String>,
        #[arg(long)]
        output_device: Option<String>,
    },
    /// Ask the council once and save the answer
    Ask {
        text: String,
        #[arg(long, default_value_t = InteractionMode::Collaborative)]
        mode: InteractionMode,
        /// Image, audio or video file sent with the question
        #[arg(long)]
        media: Option<PathBuf>,
        /// Do not feed the previous memory back in
        #[arg(long)]
        fresh: bool,
        #[arg(long, default_value = DEFAULT_HISTORY_FILE)]
        history_file: PathBuf,
    },
    /// List saved answers
    History {
        #[arg(long, default_value = DEFAULT_HISTORY_FILE)]
        history_file: PathBuf,
    },
}

/// Commands typed on stdin during a voice session
#[derive(Debug, PartialEq)]
enum Control {
    ToggleMute,
    Quit,
    Restart(Option<InteractionMode>),
    Unknown(String),
}

fn parse_control(line: &str) -> Option<Control> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    Some(match command {
        "m" | "mute" => Control::ToggleMute,
        "q" | "quit" | "exit" => Control::Quit,
        "r" | "restart" => match words.next() {
            None => Control::Restart(None),
            Some(mode) => match InteractionMode::from_str(mode) {
                Ok(mode) => Control::Restart(Some(mode)),
                Err(_) => Control::Unknown(line.trim().to_string()),
            },
        },
        _ => Control::Unknown(line.trim().to_string()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Voice {
            mode,
            muted,
            voice,
            input_device,
            output_device,
        } => {
            let mut config = VoiceConfig::default();
            if let Some(voice) = voice {
                config.voice = voice;
            }
            config.input_device = input_device;
            config.output_device = output_device;
            run_voice(config, mode, muted).await
        }
        Command::Ask {
            text,
            mode,
            media,
            fresh,
            history_file,
        } => run_ask(text, mode, media, fresh, history_file).await,
        Command::History { history_file } => {
            print_history(&HistoryStore::load(history_file));
            Ok(())
        }
    }
}

async fn run_voice(config: VoiceConfig, mode: InteractionMode, muted: bool) -> anyhow::Result<()> {
    let api = load_config()?;
    let connector = Arc::new(LiveConnector::new(&api, &config.live_endpoint));
    let controller = SessionController::new(
        config,
        Arc::new(CpalCapture::new()),
        Arc::new(CpalOutput::new()),
        connector,
    );
    controller.set_muted(muted);
    let mut status_rx = controller.subscribe();
    let mut current_mode = mode;

    println!("🎧 Starting {} session", current_mode);
    println!("   m = mute/unmute, r [mode] = restart, q = quit");
    if let Err(e) = controller.start(current_mode).await {
        println!("❌ {}", e.status_message());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = StatusPrinter::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_control(&line) {
                    Some(Control::ToggleMute) => {
                        let muted = controller.toggle_mute();
                        println!("{}", if muted { "🔇 Muted" } else { "🎤 Unmuted" });
                    }
                    Some(Control::Quit) => break,
                    Some(Control::Restart(next)) => {
                        current_mode = next.unwrap_or(current_mode);
                        println!("🔄 Restarting in {} mode", current_mode);
                        if let Err(e) = controller.start(current_mode).await {
                            println!("❌ {}", e.status_message());
                        }
                    }
                    Some(Control::Unknown(input)) => println!("Unknown command: {}", input),
                    None => {}
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                printed.print(&status);
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    controller.stop();
    println!("\n👋 Goodbye!");
    Ok(())
}

/// Prints status lines only when something a person would notice changed.
#[derive(Default)]
struct StatusPrinter {
    headline: String,
    transcript: Option<String>,
}

impl StatusPrinter {
    fn print(&mut self, status: &SessionStatus) {
        let headline = status.headline();
        if headline != self.headline {
            let icon = match status.lifecycle {
                LifecycleState::Error => "❌",
                LifecycleState::Active => "🟢",
                _ => "⚪",
            };
            println!("{} {}", icon, headline);
            self.headline = headline;
        }

        let transcript = status
            .transcript
            .as_ref()
            .map(|line| format!("{}: {}", line.source, line.text));
        if transcript != self.transcript {
            if let Some(line) = &transcript {
                println!("   {}", line);
            }
            self.transcript = transcript;
        }
    }
}

async fn run_ask(
    text: String,
    mode: InteractionMode,
    media: Option<PathBuf>,
    fresh: bool,
    history_file: PathBuf,
) -> anyhow::Result<()> {
    let api = load_config()?;
    let client = CouncilClient::new(&api, GenerationConfig::default())?;
    let mut history = HistoryStore::load(history_file);

    let media = media
        .map(|path| MediaAttachment::from_path(&path))
        .transpose()?;
    let request = CouncilRequest {
        text: text.clone(),
        mode,
        media,
        prior_memory: if fresh { None } else { history.latest_memory() },
    };

    match client.ask(&request).await {
        Ok(response) => {
            println!("📜 {}", response.context_description);
            for turn in &response.dialogue {
                match &turn.emotion {
                    Some(emotion) => println!("{} ({}): {}", turn.agent, emotion, turn.content),
                    None => println!("{}: {}", turn.agent, turn.content),
                }
            }
            if let Err(e) = history.add(HistoryEntry::new(&text, mode, response)) {
                println!("⚠️  {}", e.status_message());
            }
        }
        Err(e) => {
            log::error!("Generation failed: {}", e);
            println!("❌ {}", e.user_message());
        }
    }
    Ok(())
}

fn print_history(history: &HistoryStore) {
    if history.is_empty() {
        println!("No saved answers in {}", history.path().display());
        return;
    }
    for (index, entry) in history.entries().iter().enumerate() {
        println!(
            "{:>3}. {} [{}] {}",
            index + 1,
            entry.created_at.format("%Y-%m-%d %H:%M"),
            entry.mode,
            entry.prompt
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controls() {
        assert_eq!(parse_control("m"), Some(Control::ToggleMute));
        assert_eq!(parse_control("  q  "), Some(Control::Quit));
        assert_eq!(parse_control("r"), Some(Control::Restart(None)));
        assert_eq!(
            parse_control("r competitive"),
            Some(Control::Restart(Some(InteractionMode::Competitive)))
        );
        assert_eq!(
            parse_control("r chaos"),
            Some(Control::Unknown("r chaos".to_string()))
        );
        assert_eq!(parse_control(""), None);
    }
}
