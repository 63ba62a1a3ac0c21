mod etunnel;

use clap::{CommandFactory, Parser, error::ErrorKind};

#[derive(Debug, Parser)]
#[command(
    name = "etunnel",
    version,
    about = "etunnel - transparent TCP tunnel",
    override_usage = "etunnel -f address:port -t address:port [-b bind_to_forward] [-d]"
)]
struct Cli {
    /// Local endpoint to listen on (address:port; ":port" binds all interfaces).
    #[arg(short = 'f', long = "from", value_name = "ADDRESS:PORT")]
    from: Option<String>,

    /// Destination every accepted connection is forwarded to.
    #[arg(short = 't', long = "to", value_name = "ADDRESS:PORT")]
    to: Option<String>,

    /// Local address outbound connections are bound to before connecting.
    #[arg(short = 'b', long = "bind", value_name = "ADDRESS")]
    bind: Option<String>,

    /// Log at debug level and echo relayed payload to stdout.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Optional config file (.toml/.yaml/.yml). If omitted, etunnel.toml > etunnel.yaml > etunnel.yml are looked for in the working directory. Flags override file values.
    #[arg(long, env = "ETUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = etunnel::config::Overrides {
        from: cli.from,
        to: cli.to,
        bind: cli.bind,
        debug: cli.debug,
    };

    let cfg = match etunnel::config::load(cli.config.as_deref(), &overrides) {
        Ok(cfg) => cfg,
        Err(err) if err.is_usage() => Cli::command().error(ErrorKind::ValueValidation, err).exit(),
        Err(err) => return Err(err.into()),
    };

    etunnel::run(cfg).await
}
