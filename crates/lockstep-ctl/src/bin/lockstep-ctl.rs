//! lockstep-ctl — drive an injected process over its control socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use lockstep_ctl::{ClientError, ControllerClient, Movie, MovieError};
use lockstep_protocol::InputVector;
use log::{info, warn};
use snafu::Snafu;

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Controller error"), context(false))]
    Client { source: ClientError },
    #[snafu(display("Movie error"), context(false))]
    Movie { source: MovieError },
    #[snafu(display("{message}"))]
    Other { message: String },
}

#[derive(Parser)]
#[command(name = "lockstep-ctl")]
#[command(about = "Controller for lockstep record/replay sessions")]
#[command(version)]
struct Cli {
    /// Control socket of the injected process
    #[arg(short, long, env = "LOCKSTEP_SOCKET", default_value = "/tmp/lockstep.socket", global = true)]
    socket: PathBuf,

    /// Seconds to wait for the injected process to start listening
    #[arg(long, default_value_t = 10, global = true)]
    wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a movie
    Play {
        /// Path to movie file
        #[arg(short, long)]
        movie: PathBuf,

        /// Stop after this many frames (default: whole movie)
        #[arg(short, long)]
        frames: Option<usize>,

        /// Save into SLOT after the last frame played
        #[arg(long)]
        save: Option<u32>,

        /// Skip real-time pacing
        #[arg(long)]
        fast_forward: bool,

        /// Slow real time down by this factor
        #[arg(long)]
        divisor: Option<u32>,

        /// Refuse to play into a different executable
        #[arg(long)]
        strict: bool,
    },

    /// Advance frames with nothing pressed, recording them to a movie
    Idle {
        /// Number of frames
        #[arg(short, long)]
        frames: u64,

        /// Write the frames as a movie
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seed the target was started with, recorded in the movie
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Load a slot, then advance frames with nothing pressed
    Load {
        /// Slot to load
        #[arg(long)]
        slot: u32,

        /// Frames to run after loading
        #[arg(short, long, default_value_t = 0)]
        frames: u64,
    },

    /// Show movie metadata and the environment needed to replay it
    Info {
        /// Path to movie file
        #[arg(short, long)]
        movie: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let wait = Duration::from_secs(cli.wait);

    let result = match cli.command {
        Commands::Play {
            movie,
            frames,
            save,
            fast_forward,
            divisor,
            strict,
        } => cmd_play(&cli.socket, wait, movie, frames, save, fast_forward, divisor, strict),
        Commands::Idle { frames, output, seed } => cmd_idle(&cli.socket, wait, frames, output, seed),
        Commands::Load { slot, frames } => cmd_load(&cli.socket, wait, slot, frames),
        Commands::Info { movie } => cmd_info(movie),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", snafu::Report::from_error(e));
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_play(
    socket: &Path,
    wait: Duration,
    movie_path: PathBuf,
    frames: Option<usize>,
    save: Option<u32>,
    fast_forward: bool,
    divisor: Option<u32>,
    strict: bool,
) -> Result<(), CliError> {
    let movie = Movie::load(&movie_path)?;
    let mut client = ControllerClient::connect(socket, wait)?;

    if let Some(expected) = movie.identity {
        if expected != client.hello().identity {
            if strict {
                return OtherSnafu {
                    message: format!(
                        "movie was recorded against executable {:#x}, target is {:#x}",
                        expected,
                        client.hello().identity
                    ),
                }
                .fail();
            }
            warn!("movie was recorded against a different executable");
        }
    }
    if fast_forward {
        client.set_fast_forward(true)?;
    }
    if let Some(divisor) = divisor {
        client.set_speed_divisor(divisor)?;
    }

    let end = frames.unwrap_or(movie.len());
    info!("playing {} of {} frames", end.min(movie.len()), movie.len());
    if let Some(ack) = movie.play(&mut client, 0..end)? {
        println!("frame {} at {}.{:09}s", ack.frame, ack.ticks_sec, ack.ticks_nsec);
    }
    if let Some(slot) = save {
        client.save(slot)?;
        println!("saved slot {}", slot);
    }
    client.terminate()?;
    Ok(())
}

fn cmd_idle(socket: &Path, wait: Duration, frames: u64, output: Option<PathBuf>, seed: u64) -> Result<(), CliError> {
    let mut client = ControllerClient::connect(socket, wait)?;
    let mut movie = Movie {
        seed,
        identity: Some(client.hello().identity),
        ..Movie::default()
    };
    let idle = InputVector::default();
    for _ in 0..frames {
        let ack = client.advance(&idle)?;
        movie.push(idle);
        log::debug!("frame {}", ack.frame);
    }
    client.terminate()?;
    if let Some(path) = output {
        movie.save(&path)?;
        println!("wrote {} frames to {}", movie.len(), path.display());
    }
    Ok(())
}

fn cmd_load(socket: &Path, wait: Duration, slot: u32, frames: u64) -> Result<(), CliError> {
    let mut client = ControllerClient::connect(socket, wait)?;
    client.load(slot)?;
    println!("loaded slot {}", slot);
    let idle = InputVector::default();
    for _ in 0..frames {
        let ack = client.advance(&idle)?;
        log::debug!("frame {}", ack.frame);
    }
    client.terminate()?;
    Ok(())
}

fn cmd_info(movie_path: PathBuf) -> Result<(), CliError> {
    let movie = Movie::load(&movie_path)?;
    println!("Movie: {}", movie_path.display());
    println!("  Frames:    {}", movie.len());
    println!("  Framerate: {}/{}", movie.fps_num, movie.fps_den);
    println!("  Seed:      {}", movie.seed);
    match movie.identity {
        Some(id) => println!("  Identity:  {:#x}", id),
        None => println!("  Identity:  (any)"),
    }
    println!("\nEnvironment:");
    for (var, value) in movie.environment() {
        println!("  {}={}", var, value);
    }
    Ok(())
}
