// Yggdrasil node - CLI

use clap::Parser;
use yggdrasil_node::{Cli, CliHandler};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    if let Err(e) = CliHandler::new().handle(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
