//! ARX Bus Scanner
//!
//! Probes every board address on a bus and prints what answers: identity,
//! channel configuration, supply current and 1-wire temperatures.
//!
//! Usage:
//!   cargo run --example scan_bus -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: first USB serial adapter)
//!   --baud RATE       Baud rate (default: 19200)
//!   --config FILE     JSON bus configuration (overrides --port/--baud)
//!   --sim             Scan a simulated bus instead of real hardware
//!
//! Set RUST_LOG=arxbus_core=trace to see every frame on the wire.

use anyhow::{bail, Context, Result};
use arxbus_core::prelude::*;
use arxbus_core::protocol::{list_ports, DEFAULT_BAUD_RATE};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn simulated_bus(config: BusConfig) -> BusTransport {
    let sim = SimulatedBus::new();
    sim.add_board(0x81, SimBoard::new(0x0101).with_coupling(0x00FF));
    sim.add_board(
        0x9F,
        SimBoard::new(0x011F).with_sensors(vec![
            SimSensor::new(0x2800_0000_0A1B_C301, 0x1720),
            SimSensor::new(0x2800_0000_0A1B_C302, 0x1810),
        ]),
    );
    BusTransport::new(Box::new(sim), config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = BusConfig::default();
    let mut use_sim = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                config.port_name = args.get(i).cloned().context("--port needs a value")?;
            }
            "--baud" | "-b" => {
                i += 1;
                let rate = args.get(i).context("--baud needs a value")?;
                config.baud_rate = rate.parse().unwrap_or(DEFAULT_BAUD_RATE);
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a value")?;
                config = BusConfig::load(path)
                    .with_context(|| format!("loading bus configuration {}", path))?;
            }
            "--sim" => use_sim = true,
            other => bail!("unknown option {}", other),
        }
        i += 1;
    }

    let transport = if use_sim {
        println!("Scanning simulated bus");
        simulated_bus(config)
    } else {
        if config.port_name.is_empty() {
            config.port_name = list_ports()
                .into_iter()
                .next()
                .map(|p| p.name)
                .context("no serial ports found, pass --port")?;
        }
        println!(
            "Scanning {} at {} baud",
            config.port_name, config.baud_rate
        );
        BusTransport::open(config).context("opening bus")?
    };
    let dispatcher = Dispatcher::new(Arc::new(transport));

    let mut found = 0;
    for address in BoardAddress::all_boards() {
        let mut board = BoardSession::new(dispatcher.clone(), address);
        let info = match board.board_info() {
            Ok(info) => info,
            Err(DispatchError::DeviceUnreachable { .. }) => continue,
            Err(e) => {
                println!("{}: {}", address, e);
                continue;
            }
        };
        found += 1;
        println!(
            "\nBoard {} (#{}) serial {:04X} firmware {:04X}",
            address,
            address.board_number(),
            info.serial_number,
            info.firmware_version
        );

        let coupling = info.coupling();
        for (chan, readout) in board.all_channels()?.iter().enumerate() {
            let config = readout.config();
            println!(
                "  ch{:<2} {:?} signal={} lpf_wide={} hpf_wide={} atten={:.1}+{:.1} dB dc={}{}",
                chan,
                coupling[chan],
                config.signal_enabled,
                config.lowpass_wide,
                config.highpass_wide,
                config.atten1.db(),
                config.atten2.db(),
                config.dc_power_on,
                if readout.is_ambiguous() { " (unreadable?)" } else { "" }
            );
        }

        println!("  supply current: {:.0} mA", board.board_current()?);
        println!("  processor: {:.1} °C", board.chip_temperature()?);

        match board.onewire_search() {
            Ok(0) => {}
            Ok(_) => {
                for sensor in board.onewire_sensors()? {
                    println!(
                        "  1-wire #{} {:016X}: {:.2} °C",
                        sensor.index, sensor.serial_number, sensor.temperature
                    );
                }
            }
            Err(e) => println!("  1-wire: {}", e),
        }
    }

    println!("\n{} board(s) found", found);
    Ok(())
}
