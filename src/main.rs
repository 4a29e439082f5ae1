use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use daemonize::Daemonize;
use gp7101_bl::{
    BrightnessManager, LinuxBus,
    backlight::BacklightClass,
    config::{Config, DEFAULT_CONFIG_PATH},
    gp7101::{self, Gp7101, I2cDevice},
    i2c::I2cClient,
};
use log::{error, info, warn};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(name = "gp7101-bl")]
#[command(about = "GP7101 I2C backlight driver and brightness daemon")]
struct Cli {
    /// Device configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the I2C adapter from the configuration
    #[arg(long, global = true)]
    bus: Option<PathBuf>,
    /// Override the slave address from the configuration
    #[arg(long, global = true, value_parser = parse_address)]
    address: Option<u16>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the controller and serve brightness requests
    Daemon {
        /// Fork into the background
        #[arg(short, long)]
        detach: bool,
    },
    /// Get current brightness as JSON for waybar
    Get {
        /// Read the control register instead of asking the daemon
        #[arg(long)]
        hardware: bool,
    },
    /// Increase brightness
    Up {
        #[arg(short, long, default_value_t = 5)]
        step: u32,
    },
    /// Decrease brightness
    Down {
        #[arg(short, long, default_value_t = 5)]
        step: u32,
    },
    /// Set absolute brightness level
    Set {
        #[arg(value_name = "VALUE")]
        value: u32,
    },
    /// Stop the daemon
    Stop,
}

const SOCKET_PATH: &str = "/tmp/gp7101-bl.sock";
const PID_FILE: &str = "/tmp/gp7101-bl.pid";
const LOG_FILE: &str = "/tmp/gp7101-bl.log";

fn parse_address(s: &str) -> Result<u16> {
    let addr = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    if addr > 0x7f {
        bail!("address 0x{addr:x} is not a 7-bit I2C address");
    }
    Ok(addr)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config)?;
    if let Some(bus) = &cli.bus {
        config.bus = bus.clone();
    }
    if let Some(address) = cli.address {
        config.address = address;
    }
    Ok(config)
}

fn open_client(config: &Config) -> Result<I2cClient<LinuxBus>> {
    let bus = LinuxBus::open(&config.bus)
        .with_context(|| format!("opening {}", config.bus.display()))?;
    Ok(I2cClient::new(bus, config.address))
}

fn device(config: &Config) -> Result<I2cDevice<LinuxBus>> {
    Ok(I2cDevice {
        client: open_client(config)?,
        node: config.node.clone(),
        class: BacklightClass::new(),
        name: config.name.clone(),
    })
}

fn bind(config: &Config) -> Result<Gp7101<LinuxBus>> {
    Ok(gp7101::bind(device(config)?)?)
}

/// Binds starting from the level latched in hardware rather than the
/// configured default.
fn bind_in_place(config: &Config) -> Result<Gp7101<LinuxBus>> {
    let mut device = device(config)?;
    let level = gp7101::seed_from_hardware(&mut device)
        .context("reading current brightness")?;
    info!("control register holds {level}");
    Ok(gp7101::bind(device)?)
}

fn format_result(res: Result<u32>, max: u32) -> String {
    match res {
        Ok(val) => {
            // Hardware may hold a level above the configured maximum.
            let val = val.min(max);
            let percentage = if max == 0 { 0 } else { val * 100 / max };
            json!({
                "text": val.to_string(),
                "percentage": percentage,
                "tooltip": format!("Brightness: {}/{} ({}%)", val, max, percentage)
            })
            .to_string()
        }
        Err(e) => json!({
            "text": "?",
            "percentage": 0,
            "tooltip": format!("Error: {}", e)
        })
        .to_string(),
    }
}

fn handle_client<M>(mut stream: UnixStream, manager: Arc<M>)
where
    M: BrightnessManager<Error = anyhow::Error> + ?Sized,
{
    let mut line = String::new();
    let mut reader = BufReader::new(&stream);

    let Ok(_) = reader.read_line(&mut line) else {
        return;
    };
    let command = line.trim();
    let max = manager.max_brightness();
    let response = match command {
        "get" => format_result(manager.get_brightness(), max),
        cmd if cmd.starts_with("up ") => {
            let step: i32 = cmd.strip_prefix("up ").unwrap_or("5").parse().unwrap_or(5);
            format_result(manager.adjust_brightness(step), max)
        }
        cmd if cmd.starts_with("down ") => {
            let step: i32 = cmd
                .strip_prefix("down ")
                .unwrap_or("5")
                .parse()
                .unwrap_or(5);
            format_result(manager.adjust_brightness(step.saturating_neg()), max)
        }
        cmd if cmd.starts_with("set ") => match cmd.strip_prefix("set ").unwrap_or("").parse() {
            Ok(value) => format_result(manager.set_brightness(value), max),
            Err(e) => format_result(Err(anyhow::Error::new(e).context("bad level")), max),
        },
        "stop" => {
            let _ = writeln!(stream, "OK stopping");
            let _ = std::fs::remove_file(SOCKET_PATH);
            let _ = std::fs::remove_file(PID_FILE);
            info!("stopping on request");
            process::exit(0);
        }
        _ => "ERROR unknown command".to_string(),
    };

    let _ = writeln!(stream, "{}", response);
}

/// Opens the file a detached daemon's stderr goes to.
fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn start_daemon(config: &Config, detach: bool) -> Result<()> {
    if Path::new(SOCKET_PATH).exists() {
        bail!("Daemon already running (socket exists)");
    }

    if detach {
        let log = open_log(Path::new(LOG_FILE))?;
        Daemonize::new()
            .pid_file(PID_FILE)
            .stderr(log)
            .working_directory("/")
            .start()
            .context("failed to daemonize")?;
    } else {
        std::fs::write(PID_FILE, process::id().to_string())?;
    }

    let device = bind(config)?;
    let backlight = Arc::clone(device.backlight());
    let listener = UnixListener::bind(SOCKET_PATH)?;

    info!(
        "{} bound at 0x{:02x} on {}, listening on {}",
        backlight.name(),
        config.address,
        config.bus.display(),
        SOCKET_PATH
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let backlight = Arc::clone(&backlight);
                thread::spawn(move || {
                    handle_client(stream, backlight);
                });
            }
            Err(err) => {
                error!("Error accepting connection: {}", err);
            }
        }
    }

    device.remove();
    Ok(())
}

fn send_command(command: &str) -> Result<String> {
    let mut stream = UnixStream::connect(SOCKET_PATH)?;
    writeln!(stream, "{}", command)?;

    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;

    Ok(response.trim().to_string())
}

/// Runs `op` against a freshly bound device when no daemon answers.
fn direct<F>(cli: &Cli, what: &str, op: F) -> String
where
    F: FnOnce(&gp7101::Gp7101Backlight<LinuxBus>) -> Result<u32>,
{
    warn!("Daemon not running, {what} directly");
    match load_config(cli).and_then(|config| bind_in_place(&config)) {
        Ok(device) => {
            let backlight = device.backlight();
            let response = format_result(op(backlight), backlight.max_brightness());
            device.remove();
            response
        }
        Err(e) => format_result(Err(e), 0),
    }
}

fn read_hardware(cli: &Cli) -> String {
    let res = load_config(cli).and_then(|config| {
        let mut client = open_client(&config)?;
        let level = gp7101::read_brightness(&mut client)?;
        let max = gp7101::resolve_properties(&config.node).max_brightness;
        Ok((u32::from(level), max))
    });
    match res {
        Ok((level, max)) => format_result(Ok(level), max),
        Err(e) => format_result(Err(e), 0),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let response = match &cli.command {
        Commands::Daemon { detach } => {
            let res = load_config(&cli).and_then(|config| start_daemon(&config, *detach));
            if let Err(e) = res {
                error!("Error starting daemon: {:#}", e);
                process::exit(1);
            }
            return;
        }
        Commands::Get { hardware: true } => read_hardware(&cli),
        Commands::Get { hardware: false } => send_command("get").unwrap_or_else(|_| {
            // Binding would push the default level, so only read back.
            warn!("Daemon not running, reading control register");
            read_hardware(&cli)
        }),
        Commands::Up { step } => {
            let step = i32::try_from(*step).unwrap_or(i32::MAX);
            send_command(&format!("up {}", step)).unwrap_or_else(|_| {
                direct(&cli, "adjusting brightness", |bl| bl.adjust_brightness(step))
            })
        }
        Commands::Down { step } => {
            let step = i32::try_from(*step).unwrap_or(i32::MAX);
            send_command(&format!("down {}", step)).unwrap_or_else(|_| {
                direct(&cli, "adjusting brightness", |bl| bl.adjust_brightness(-step))
            })
        }
        Commands::Set { value } => {
            let value = *value;
            send_command(&format!("set {}", value)).unwrap_or_else(|_| {
                direct(&cli, "setting brightness", |bl| {
                    BrightnessManager::set_brightness(bl, value)
                })
            })
        }
        Commands::Stop => match send_command("stop") {
            Ok(response) => response,
            Err(e) => {
                eprintln!("Error stopping daemon: {}", e);
                // Try to clean up files anyway
                let _ = std::fs::remove_file(SOCKET_PATH);
                let _ = std::fs::remove_file(PID_FILE);
                return;
            }
        },
    };
    println!("{}", response);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percentage(response: &str) -> u64 {
        let value: serde_json::Value = serde_json::from_str(response).unwrap();
        value["percentage"].as_u64().unwrap()
    }

    #[test]
    fn level_above_max_reports_full_scale() {
        let response = format_result(Ok(250), 200);
        assert_eq!(percentage(&response), 100);
        assert!(response.contains("200/200"), "{response}");
    }

    #[test]
    fn percentage_scales_with_max() {
        assert_eq!(percentage(&format_result(Ok(50), 200)), 25);
        assert_eq!(percentage(&format_result(Ok(0), 0)), 0);
        assert_eq!(percentage(&format_result(Err(anyhow::anyhow!("bus")), 0)), 0);
    }

    #[test]
    fn daemon_log_is_appended_to() {
        let path = std::env::temp_dir().join(format!("gp7101-bl-{}.log", process::id()));
        let _ = std::fs::remove_file(&path);

        writeln!(open_log(&path).unwrap(), "first").unwrap();
        writeln!(open_log(&path).unwrap(), "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn addresses_parse_as_hex_or_decimal() {
        assert_eq!(parse_address("0x2c").unwrap(), 0x2c);
        assert_eq!(parse_address("44").unwrap(), 44);
        assert!(parse_address("0x80").is_err());
    }
}
