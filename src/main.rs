use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::process;

use rsrv::engine::Engine;
use rsrv::proto;
use rsrv::{Config, Interp, Isolation, Server};

#[derive(clap::ArgEnum, Debug, Copy, Clone)]
enum IsolationArg {
    Fork,
    Thread,
    Inline,
}

impl From<IsolationArg> for Isolation {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::Fork => Isolation::Fork,
            IsolationArg::Thread => Isolation::Thread,
            IsolationArg::Inline => Isolation::Inline,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = proto::DEFAULT_PORT)]
    port: u16,

    #[clap(long, default_value = "/tmp/Rserv")]
    workdir: PathBuf,

    #[clap(long, help = "accept connections from non-loopback peers")]
    remote: bool,

    #[clap(long, arg_enum, default_value = "fork")]
    isolation: IsolationArg,

    #[clap(long, default_value_t = proto::MAX_REQUEST)]
    max_request: usize,

    #[clap(help = "arguments forwarded to the interpreter's initialization")]
    engine_args: Vec<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    if !proto::byte_sex_ok() {
        eprintln!("FATAL: byte-order self-check failed, refusing to speak the wire format");
        process::exit(-100);
    }

    let args = Args::parse();

    let mut engine = Interp::new();
    if let Err(code) = engine.init(&args.engine_args) {
        eprintln!("failed to initialize the interpreter (code {code})");
        process::exit(-1);
    }

    let config = Config {
        port: args.port,
        workdir: args.workdir,
        local_only: !args.remote,
        max_request: args.max_request,
        isolation: args.isolation.into(),
    };
    Server::new(engine, config).start()?;
    Ok(())
}
