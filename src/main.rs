#![allow(clippy::multiple_crate_versions)]

use clap::{Arg, ArgAction, Command};

use helix_runtime::{Capabilities, GatewayConfig, GatewayRuntime};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("helix")
        .version(VERSION)
        .about("Helix - grounded Ask gateway")
        .subcommand(
            Command::new("serve")
                .about("Start the gateway HTTP server")
                .arg(
                    Arg::new("bind")
                        .short('b')
                        .long("bind")
                        .value_name("ADDRESS")
                        .help("Address to bind (overrides HELIX_BIND_ADDRESS)"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("Port to listen on (overrides HELIX_PORT)"),
                ),
        )
        .subcommand(
            Command::new("doctor")
                .about("Check configuration and capability wiring")
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Print the resolved configuration"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("serve", sub_matches)) => {
            let mut config = match GatewayConfig::from_env() {
                Ok(config) => config,
                Err(error) => {
                    eprintln!("Configuration error: {error}");
                    std::process::exit(1);
                }
            };
            if let Some(bind) = sub_matches.get_one::<String>("bind") {
                config.api.bind_address = bind.clone();
            }
            if let Some(port) = sub_matches.get_one::<String>("port") {
                match port.parse() {
                    Ok(port) => config.api.port = port,
                    Err(_) => {
                        eprintln!("Invalid port: {port}");
                        std::process::exit(1);
                    }
                }
            }

            let runtime = match GatewayRuntime::new(config, Capabilities::from_env()) {
                Ok(runtime) => runtime,
                Err(error) => {
                    eprintln!("Failed to build the runtime: {error}");
                    std::process::exit(1);
                }
            };

            let served = tokio::select! {
                result = runtime.serve() => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received, shutting down");
                    Ok(())
                }
            };
            runtime.shutdown();
            if let Err(error) = served {
                eprintln!("Server error: {error}");
                std::process::exit(1);
            }
        }
        Some(("doctor", sub_matches)) => {
            match GatewayConfig::from_env() {
                Ok(config) => {
                    println!("Configuration: OK");
                    for prefix in ["HELIX_PLANNER", "HELIX_EXECUTOR", "HELIX_LATTICE", "HELIX_MODEL"] {
                        let wired = std::env::var(format!("{prefix}_URL")).is_ok();
                        println!(
                            "  {prefix}: {}",
                            if wired { "http" } else { "static fallback" }
                        );
                    }
                    if sub_matches.get_flag("verbose") {
                        match serde_json::to_string_pretty(&config) {
                            Ok(rendered) => println!("{rendered}"),
                            Err(error) => eprintln!("Failed to render config: {error}"),
                        }
                    }
                }
                Err(error) => {
                    eprintln!("Configuration error: {error}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            println!("Helix v{VERSION}");
            println!("Use --help for available commands");
        }
    }
}
