use clap::Parser;
use color_eyre::Result;

use rsrv::proto;
use rsrv::Client;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    #[clap(short, long, default_value_t = proto::DEFAULT_PORT)]
    port: u16,

    #[clap(long, help = "ask the server to shut down after any evaluations")]
    shutdown: bool,

    #[clap(help = "expressions to evaluate, one request each")]
    exprs: Vec<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let mut client = Client::connect(&args.host, args.port)?;
    for src in &args.exprs {
        let value = client.eval(src)?;
        println!("{value:?}");
    }
    if args.shutdown {
        client.shutdown()?;
    }
    Ok(())
}
