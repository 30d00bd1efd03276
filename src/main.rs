use clap::Parser;
use dbg_relay::config::{Args, Config};
use dbg_relay::log;
use dbg_relay::supervisor::Supervisor;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args)?;

    log::init(config.log_file.as_deref())?;
    if config.quiet {
        log::disable();
    }

    Supervisor::run(config)
}
