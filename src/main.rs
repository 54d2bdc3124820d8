use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let verbose = args.verbose;
    let config = args.config;

    match args.command {
        Commands::Setup {
            identity,
            key_server_url,
            token,
            policy_file,
            poll_interval,
        } => commands::agent::setup(config, identity, key_server_url, token, policy_file, poll_interval, verbose),
        Commands::Run => commands::agent::run(config, verbose),
        Commands::Apply { policy_file, identity } => commands::agent::apply(config, policy_file, identity, verbose),
        Commands::Prefix {
            username,
            email,
            uuid,
            superuser,
            profile,
        } => commands::agent::prefix(config, username, email, uuid, superuser, profile, verbose),
        Commands::CheckConfig => commands::agent::check_config(config, verbose),
    }
}
