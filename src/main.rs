//! Process entry point: argument parsing, logging, signal handling, and
//! the control-channel accept loop (`spec.md` §4.7, §6).
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;

use pir_gpud::arb::{list_devices, Arb};
use pir_gpud::cli::Args;
use pir_gpud::control::{self, ServeExit};

fn main() -> ExitCode {
    env_logger::init();

    // clap's default `Args::parse()` exits unrecognized-flag errors with
    // status 2; `spec.md` §6 requires status 1 for those, so parse
    // manually and pick the exit code ourselves.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    if args.list {
        return match list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("{}: {}", device.index, device.name);
                }
                ExitCode::from(1)
            }
            Err(e) => {
                eprintln!("failed to enumerate devices: {e}");
                ExitCode::from(1)
            }
        };
    }

    match run(&args) {
        Ok(exit) => exit,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let shutdown = Arc::new(AtomicBool::new(false));
    register_signal_handlers(&shutdown).context("failed to install signal handlers")?;

    let result = control::serve::<Arb>(&args.socket, args.device, &shutdown);
    let _ = std::fs::remove_file(&args.socket);

    match result {
        Ok(ServeExit::Interrupted) => {
            log::info!("shutting down on signal");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("control loop terminated"),
    }
}

fn register_signal_handlers(shutdown: &Arc<AtomicBool>) -> Result<(), std::io::Error> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(shutdown))?;
    Ok(())
}
