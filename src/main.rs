use clap::Parser;

use dirwatch::cli::commands::{init, watch};
use dirwatch::cli::{Cli, Commands, load_settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    dirwatch::logging::init_with_config(&settings.logging);

    let code = match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&settings),
        Commands::Watch(args) => match watch::run_watch(args, &settings).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e:#}");
                1
            }
        },
    };

    std::process::exit(code);
}
