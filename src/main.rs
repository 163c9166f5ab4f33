//! gRPC Mock Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use grpc_mock_server::{CallContext, CanonicalMessage, MockServer, MockServerConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = include_str!("../demos/default-config.yaml");

#[derive(Parser, Debug)]
#[command(
    name = "grpc-mock-server",
    about = "Mock gRPC server core - answer calls from configured stubs",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// List supported methods and exit
    #[arg(long)]
    list_methods: bool,

    /// Print an example stub for every method and exit
    #[arg(long)]
    examples: bool,

    /// Method to call (e.g. "helloworld.Greeter/SayHello")
    #[arg(short, long)]
    method: Option<String>,

    /// Request message as JSON
    #[arg(short, long, default_value = "{}")]
    request: String,

    /// Call metadata as key=value (repeatable)
    #[arg(long = "metadata", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in {:?}", s))?;
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so call output stays clean
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", DEFAULT_CONFIG);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        MockServerConfig::from_yaml(DEFAULT_CONFIG)?
    };

    let stub_count = config.stubs.len();
    let server = MockServer::from_config(config)?;

    if args.validate {
        println!(
            "Configuration is valid ({} methods, {} stubs defined)",
            server.registry().supported_methods().len(),
            stub_count
        );
        return Ok(());
    }

    if args.list_methods {
        for method in server.registry().supported_methods() {
            println!("{}", method);
        }
        return Ok(());
    }

    if args.examples {
        let examples = server.registry().payload_examples();
        print!("{}", serde_yaml::to_string(&examples)?);
        return Ok(());
    }

    let Some(method) = args.method else {
        anyhow::bail!("No method given; pass --method to make a call");
    };

    let ctx = args
        .metadata
        .into_iter()
        .fold(CallContext::default(), |ctx, (key, value)| {
            ctx.with_metadata(key, value)
        });

    let reply = server.call(&ctx, &method, &args.request)?;
    println!("{}", serde_json::to_string_pretty(&CanonicalMessage(&reply))?);

    Ok(())
}
