use clap::Parser;
use console::{Console, ConsoleConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Mirage - browser-driven intercepting proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the console server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port for the HTTP API and operator WebSocket
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory where project documents are stored
    #[arg(long, default_value = "./projects")]
    projects_dir: PathBuf,

    /// Chromium executable override (autodetected when omitted)
    #[arg(long)]
    browser_executable: Option<PathBuf>,

    /// Launch the browser without a visible window
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Seconds a disconnected operator may reconnect before suspended
    /// exchanges are released
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "console=info,intercept_core=info,browser_engine=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConsoleConfig {
        bind_address: args.bind.clone(),
        port: args.port,
        projects_dir: args.projects_dir.clone(),
        browser_executable: args.browser_executable,
        headless: args.headless,
        grace_secs: args.grace_secs,
        ..ConsoleConfig::default()
    };

    println!("🦎 Mirage starting...");
    println!(
        "🌐 Console will be available at: http://{}:{}",
        args.bind, args.port
    );
    println!("🔌 Operator channel: ws://{}:{}/ws", args.bind, args.port);
    println!("💾 Projects: {}", args.projects_dir.display());
    println!();
    println!("💡 Tip: Use --help to see all available options");
    println!();

    Console::new(config).start().await?;

    Ok(())
}
