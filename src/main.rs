use anyhow::Result;
use clap::{Parser, Subcommand};
use push_relay::logging::init_logging;
use push_relay::server::serve;
use push_relay::server_state::{Config, ServerState};
use push_relay::VapidKey;

#[derive(Parser)]
struct Opts {
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Run the HTTP server.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print a fresh VAPID key pair as environment assignments.
    GenerateKeys {
        #[arg(short, long, default_value = "support@example.com")]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let opts = Opts::parse();

    match opts.subcmd {
        SubCommand::Serve { port } => {
            let config = Config::from_env()?;
            let state = ServerState::new(&config)?;
            serve(port, state).await?;
        }
        SubCommand::GenerateKeys { email } => {
            let key = VapidKey::generate();
            println!("PUSH_VAPID_EMAIL=mailto:{}", email.trim_start_matches("mailto:"));
            println!("PUSH_VAPID_PUBKEY={}", key.public_key_base64());
            println!("PUSH_VAPID_PRIVKEY={}", key.private_key_base64());
        }
    }

    Ok(())
}
