//! Command-line surface (`spec.md` §6), parsed with `clap`.
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pir-gpud", about = "Single-server GPU-accelerated XOR-PIR query-evaluation daemon")]
pub struct Args {
    /// List accelerator devices (index: name) and exit.
    #[arg(short = 'l')]
    pub list: bool,

    /// Accelerator device index to use.
    #[arg(short = 'd', default_value_t = 0)]
    pub device: usize,

    /// Rendezvous path for the control-channel Unix socket.
    #[arg(short = 's', default_value = "pir.socket")]
    pub socket: PathBuf,
}
