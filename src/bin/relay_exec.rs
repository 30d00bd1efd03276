//! One-shot command injection: ask the debugger of a running relay to execute a command.

use anyhow::Context;
use clap::Parser;
use dbg_relay::client::Client;
use dbg_relay::config::ADDRESS_ENV;
use dbg_relay::proto::Body;
use dbg_relay::transport::Address;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address, `host:port` or `unix:/path`
    #[clap(long, env = ADDRESS_ENV)]
    address: String,

    /// Endpoint name of the debugger
    #[clap(long, default_value = "gdb")]
    debugger: String,

    /// Endpoint name of this client (default: exec-<pid>)
    #[clap(long)]
    name: Option<String>,

    /// Debugger command
    #[clap(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let address = args
        .address
        .parse::<Address>()
        .with_context(|| format!("relay address `{}`", args.address))?;
    let name = args
        .name
        .unwrap_or_else(|| format!("exec-{}", std::process::id()));

    let client = Client::connect(&address, name).context("connect to relay")?;
    client
        .notify(
            &args.debugger,
            Body::Exec {
                comm: args.command.join(" "),
            },
        )
        .context("send command")?;
    client.trap(Some(args.debugger.as_str())).context("trap debugger")?;
    client.close();
    Ok(())
}
