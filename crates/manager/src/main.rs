//! ustick-copy
//!
//! Copies the content of a source folder onto every USB stick that gets
//! plugged in, with stable per-socket port numbers for progress
//! display.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use manager::config::{Config, validate_label};
use manager::monitor::SysfsMonitor;
use manager::system::{Mode, SystemManager};
use manager::SystemCommandRunner;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ustick-copy")]
#[command(
    author,
    version,
    about = "Copy source files to multiple USB sticks as they are plugged in"
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Source folder to copy from (overrides the configured one)
    #[arg(short, long, value_name = "SOURCE_FOLDER")]
    source: Option<String>,

    /// Run in interactive mode
    #[arg(short, long)]
    interactive: bool,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Explicit run state threaded through the command loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Continue,
    Quit,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = Config::default();
        let path = Config::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(config_path.clone())).context("Failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.system.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ustick-copy v{}", env!("CARGO_PKG_VERSION"));

    if let Some(source) = args.source {
        config.source_folder = source;
    }

    let monitor = Box::new(SysfsMonitor::new(Duration::from_millis(
        config.system.update_interval_ms,
    )));
    let mut manager = SystemManager::new(
        config,
        config_path,
        Arc::new(SystemCommandRunner),
        monitor,
    );

    // SIGINT/SIGTERM clear the flag; the run loops notice and return so
    // the shutdown below still joins every in-flight worker.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to install signal handler")?;
    }

    let result = if args.interactive {
        run_interactive(&mut manager, &running)
    } else {
        run_headless(&mut manager, &running)
    };

    // Leave no mode running on the way out; this also waits for
    // in-flight workers.
    if manager.mode() != Mode::Idle {
        if let Err(e) = manager.stop() {
            eprintln!("error while stopping: {}", e);
        }
    }

    result
}

/// Headless: enter copy mode and run until a termination signal clears
/// the flag.
fn run_headless(manager: &mut SystemManager, running: &AtomicBool) -> Result<()> {
    manager.start_copy().context("Failed to enter copy mode")?;
    info!("Copy mode running; Ctrl+C to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("Signal received, shutting down");
    Ok(())
}

fn run_interactive(manager: &mut SystemManager, running: &AtomicBool) -> Result<()> {
    print_help();

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if !running.load(Ordering::SeqCst) {
            println!();
            return Ok(());
        }

        print!("command: ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            // EOF behaves like 'q'.
            println!();
            return Ok(());
        };
        let line = line.context("Failed to read input")?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match handle_command(manager, input) {
            Ok(RunState::Continue) => {}
            Ok(RunState::Quit) => return Ok(()),
            Err(e) => println!("error: {:#}", e),
        }
    }
}

fn print_help() {
    println!("{}", "*".repeat(42));
    println!("commands:");
    println!("  'map'             learn port numbers from inserted sticks");
    println!("  'copy'            process every inserted stick");
    println!("  'done'            leave the current mode");
    println!("  'show'            show attached sticks and configuration");
    println!("  'source:<path>'   set the source folder");
    println!("  'label:<name>'    set the stick label (2-11 chars)");
    println!("  'save'            write the configuration file");
    println!("  'q'               quit");
    println!("{}", "*".repeat(42));
}

fn handle_command(manager: &mut SystemManager, input: &str) -> Result<RunState> {
    match input {
        "q" => {
            if manager.mode() != Mode::Idle {
                manager.stop()?;
            }
            println!("stop script.");
            return Ok(RunState::Quit);
        }
        "map" => {
            manager.start_mapping()?;
            println!("mapping mode: insert sticks one by one; 'done' to finish.");
        }
        "copy" => {
            manager.start_copy()?;
            println!("copy mode: every inserted stick will be processed.");
        }
        "done" => {
            manager.stop()?;
            println!("back to idle.");
        }
        "show" => show(manager)?,
        "save" => {
            manager.save_config()?;
            println!("config written.");
        }
        _ => {
            if let Some(path) = input.strip_prefix("source:") {
                set_source(manager, path.trim());
            } else if let Some(label) = input.strip_prefix("label:") {
                set_label(manager, label.trim())?;
            } else {
                println!("unknown command: '{}'", input);
                print_help();
            }
        }
    }
    Ok(RunState::Continue)
}

fn show(manager: &SystemManager) -> Result<()> {
    println!("mode: {}", manager.mode());
    println!("pending workers: {}", manager.pending_workers());
    manager.redraw();

    match manager.attached_devices() {
        Ok(devices) if devices.is_empty() => println!("no sticks attached."),
        Ok(devices) => {
            println!("attached sticks:");
            for device in devices {
                println!("  {}", device);
            }
        }
        Err(e) => println!("could not list devices: {}", e),
    }

    let rendered =
        toml::to_string_pretty(manager.config()).context("Failed to render configuration")?;
    println!("configuration:\n{}", rendered);
    Ok(())
}

fn set_source(manager: &mut SystemManager, path: &str) {
    let expanded = shellexpand::tilde(path).to_string();
    if std::path::Path::new(&expanded).exists() {
        manager.config_mut().source_folder = path.to_string();
        println!("set source folder to '{}'.", path);
    } else {
        println!("input not a valid path.");
    }
}

fn set_label(manager: &mut SystemManager, label: &str) -> Result<()> {
    validate_label(label)?;
    manager.config_mut().stick.label = label.to_string();
    println!("set label to '{}'.", label);
    Ok(())
}
