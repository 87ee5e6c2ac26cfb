//! rirc — line-oriented IRC session on top of rirc-core.
//!
//! ```text
//! rirc                              Connect to the configured server
//! rirc irc.oftc.net --no-tls        Override the server
//! rirc --config <path>              Use custom config TOML
//! rirc --gen-config                 Dump default config and exit
//! ```
//!
//! Typed lines are sent to the server as raw IRC. `/connect`,
//! `/disconnect`, `/status` and `/quit [message]` control the connection.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rirc_cli::config::CliConfig;
use rirc_cli::session::Session;
use rirc_core::IoContext;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rirc", about = "rirc terminal IRC session")]
struct Cli {
    /// Server host (overrides config).
    host: Option<String>,

    /// Server port (overrides config).
    #[arg(short, long)]
    port: Option<String>,

    /// Connect without TLS.
    #[arg(long)]
    no_tls: bool,

    /// Certificate verification: disabled, optional or required.
    #[arg(long)]
    verify: Option<String>,

    /// Only use IPv4 addresses.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Only use IPv6 addresses.
    #[arg(short = '6')]
    ipv6: bool,

    /// Nickname (overrides config).
    #[arg(short, long)]
    nick: Option<String>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rirc.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(self, config: &mut CliConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.no_tls {
            config.server.tls = false;
        }
        if let Some(verify) = self.verify {
            config.server.verify = verify;
        }
        if self.ipv4 {
            config.server.family = "ipv4".into();
        }
        if self.ipv6 {
            config.server.family = "ipv6".into();
        }
        if let Some(nick) = self.nick {
            config.identity.nick = nick;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&CliConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = CliConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing. Logs go to stderr; stdout carries the session.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("rirc v{}", env!("CARGO_PKG_VERSION"));

    let flags = config.server.flags()?;
    let mut io: IoContext<String> = IoContext::init(config.io.clone())?;
    let id = io.connection(
        config.server.host.clone(),
        &config.server.host,
        &config.server.port,
        flags,
    )?;
    io.connect(id)?;

    let mut session = Session::new(id, config.identity.clone(), std::io::stdout());
    io.start(&mut session)?;

    info!("session ended");
    Ok(())
}
