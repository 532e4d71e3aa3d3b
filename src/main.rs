use std::process::exit;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;

use remote_wiring::logging::init_rust_logging;
use remote_wiring::{
    ConnectionConfig, DeviceEvent, HandshakeConfig, HardwareProfile, NetworkStream, PinMode,
    PinState, RemoteDevice, SerialConfig, SerialStream, DEFAULT_BAUD_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "remote-wiring", about = "Inspect and drive a Firmata board")]
struct Args {
    /// Serial port path (e.g., /dev/ttyACM0)
    #[arg(required_unless_present = "tcp")]
    port: Option<String>,
    /// Connect to a serial-to-TCP bridge instead (host:port)
    #[arg(long, conflicts_with = "port")]
    tcp: Option<String>,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Data bits, parity and stop bits
    #[arg(long, default_value = "8N1")]
    serial_config: SerialConfig,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the board's pin categories
    Profile,
    /// Set a pin mode (input, output, analog, pwm, servo, pullup, ...)
    Mode { pin: u8, mode: PinMode },
    /// Drive a digital pin high or low
    Write { pin: u8, state: PinState },
    /// Print the cached value of a pin after listening briefly
    Read {
        pin: u8,
        #[arg(long, default_value_t = 200)]
        wait_ms: u64,
    },
    /// Print events for a while
    Watch {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn open(args: &Args) -> Result<RemoteDevice> {
    let config = ConnectionConfig {
        baud_rate: args.baud,
        serial_config: args.serial_config,
        ..ConnectionConfig::default()
    };

    let device = match (&args.tcp, &args.port) {
        (Some(address), _) => RemoteDevice::new(NetworkStream::new(address.clone(), config.timeout)),
        (None, Some(path)) => RemoteDevice::new(SerialStream::new(path.clone(), config.timeout)),
        (None, None) => anyhow::bail!("either a serial port or --tcp is required"),
    };

    device.connect(&config).context("opening connection")?;
    device
        .handshake(&HandshakeConfig::default())
        .context("waiting for capability response")?;
    Ok(device)
}

fn print_profile(profile: &HardwareProfile) {
    println!("Pins:      {}", profile.total_pin_count());
    match profile.analog_offset() {
        Some(offset) => println!(
            "Analog:    {:?} (offset {}, {} channels)",
            profile.analog_pins(),
            offset,
            profile.analog_pin_count()
        ),
        None => println!("Analog:    none"),
    }
    println!("Digital:   {:?}", profile.digital_pins());
    println!("PWM:       {:?}", profile.pwm_pins());
    println!("Servo:     {:?}", profile.servo_pins());
    println!("I2C:       {:?}", profile.i2c_pins());
    println!("Disabled:  {:?}", profile.disabled_pins());
}

fn run() -> Result<()> {
    let args = Args::parse();
    let device = open(&args)?;

    match args.command {
        Command::Profile => {
            let profile = device
                .hardware_profile()
                .context("device reported ready without a profile")?;
            print_profile(&profile);
        }
        Command::Mode { pin, mode } => {
            device.pin_mode(pin, mode)?;
            println!("Pin {pin} -> {mode}");
        }
        Command::Write { pin, state } => {
            device.digital_write(pin, state)?;
            println!("Pin {pin} <- {state}");
        }
        Command::Read { pin, wait_ms } => {
            let profile = device
                .hardware_profile()
                .context("device reported ready without a profile")?;
            if profile.is_analog_supported(pin)? {
                device.pin_mode(pin, PinMode::Analog)?;
            } else {
                device.pin_mode(pin, PinMode::Input)?;
            }
            device.start_listening()?;
            std::thread::sleep(Duration::from_millis(wait_ms));

            if profile.is_analog_supported(pin)? {
                println!("Pin {pin} = {}", device.analog_read(pin)?);
            } else {
                println!("Pin {pin} = {}", device.digital_read(pin)?);
            }
            if !device.is_confirmed(pin)? {
                println!("(no report received yet)");
            }
        }
        Command::Watch { seconds } => {
            let events = device.events();
            device.start_listening()?;
            let deadline = Instant::now() + Duration::from_secs(seconds);
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                match events.recv_timeout(left) {
                    Ok(DeviceEvent::ConnectionLost(message)) => {
                        anyhow::bail!("connection lost: {message}")
                    }
                    Ok(event) => println!("{event:?}"),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    debug!("Closing");
    device.finish()?;
    Ok(())
}
