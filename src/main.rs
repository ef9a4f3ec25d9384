use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use procon::config::Config;
use procon::controller::{
    BoxedReader, BoxedWriter, Button, ButtonHandle, ControllerSession, SessionError, Stick,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const TAP_DURATION: Duration = Duration::from_millis(100);

/// How long runtime shutdown waits for blocking device reads
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Emulate a Pro Controller on a USB HID gadget
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// HID gadget device node, overrides the config file
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Config file, defaults to <config dir>/procon/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also log every periodic input report
    #[arg(long)]
    log_input_reports: bool,
}

/// Line commands read from stdin
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Press(Button),
    Release(Button),
    Tap(Button),
    Stick(Stick, f64, f64),
    Reset,
    Quit,
}

impl FromStr for Command {
    type Err = color_eyre::Report;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["press", button] => Command::Press(button.parse()?),
            ["release", button] => Command::Release(button.parse()?),
            ["tap", button] => Command::Tap(button.parse()?),
            ["stick", stick, x, y] => Command::Stick(stick.parse()?, x.parse()?, y.parse()?),
            ["reset"] => Command::Reset,
            ["quit"] | ["exit"] => Command::Quit,
            _ => return Err(eyre!("Unknown command: {:?}", line)),
        };
        Ok(command)
    }
}

enum Exit {
    Session(std::result::Result<(), SessionError>),
    Interrupted,
    Quit,
}

fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let runtime = runtime()?;
    let result = runtime.block_on(run(args));
    finish(runtime);
    result
}

fn runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Shuts the runtime down without waiting on a read still pending on the
/// device node. Those run on the blocking pool and outlive their future.
fn finish(runtime: Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    debug!("Runtime shut down");
}

/// Opens the gadget node with separate read and write handles, so a pending
/// read never holds up a write.
async fn open_device(path: &Path) -> Result<(BoxedReader, BoxedWriter)> {
    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| eyre!("Failed to open {}: {}", path.display(), e))?;
    let writer = device.try_clone().await?;
    Ok((Box::new(device), Box::new(writer)))
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if args.log_input_reports {
        config.log_input_reports = true;
    }
    let settings = config.session_settings()?;

    info!("Opening {}", config.device.display());
    let (reader, writer) = open_device(&config.device).await?;

    let mut session = ControllerSession::create(reader, writer, settings)?.connect();
    let buttons = session.buttons();

    info!("Commands: press|release|tap <button>, stick <left|right> <x> <y>, reset, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let exit = loop {
        tokio::select! {
            result = session.wait() => break Exit::Session(result),
            _ = tokio::signal::ctrl_c() => break Exit::Interrupted,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(Command::Quit) => break Exit::Quit,
                    Ok(command) => apply(command, &buttons),
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    };

    match exit {
        Exit::Session(Ok(())) => info!("Host closed the device"),
        Exit::Session(Err(e)) => error!("Session ended: {}", e),
        Exit::Interrupted => info!("Interrupted"),
        Exit::Quit => info!("Quit requested"),
    }

    session.shutdown().await?;
    Ok(())
}

fn apply(command: Command, buttons: &ButtonHandle) {
    match command {
        Command::Press(button) => buttons.press(button),
        Command::Release(button) => buttons.release(button),
        Command::Tap(button) => {
            buttons.press(button);
            let buttons = buttons.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TAP_DURATION).await;
                buttons.release(button);
            });
        }
        Command::Stick(stick, x, y) => buttons.set_stick(stick, x, y),
        Command::Reset => buttons.reset(),
        Command::Quit => {}
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
