use axum::{Router, routing::get};
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use quiesce::{
    App, ShutdownOutcome, ShutdownSignal,
    config::{ConfigValidator, load_config},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (TOML, YAML or JSON); `QUIESCE_*` variables override it
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the configuration and print a summary
    Validate {
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Start the server (default)
    Serve {
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(config.or(args.config)),
        Some(Commands::Serve { config }) => serve_command(config.or(args.config)).await,
        None => serve_command(args.config).await,
    }
}

fn print_banner() {
    println!(
        "Version: release {}, package {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_NAME")
    );
}

async fn serve_command(config_path: Option<String>) -> Result<()> {
    print_banner();

    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;
    tracing_setup::init_from_config(&config).context("Failed to initialize tracing")?;
    tracing::debug!("Effective configuration:\n{}", config);

    let routes = Router::new().route("/", get(|| async { "Hello from quiesce.\n" }));
    let app = App::new(config, routes).await?;

    let (reason, outcome) = app.run(&ShutdownSignal::new()).await?;
    if let ShutdownOutcome::Completed {
        force_closed,
        waited,
    } = outcome
    {
        tracing::info!(
            "Stopped after {:?}: closed {} idle connections, drained in {}",
            reason,
            force_closed,
            humantime::format_duration(waited)
        );
    }
    Ok(())
}

fn validate_config_command(config_path: Option<String>) -> Result<()> {
    match &config_path {
        Some(path) => println!("🔍 Validating configuration file: {path}"),
        None => println!("🔍 Validating configuration from environment"),
    }

    let config = match load_config(config_path.as_deref()) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!(
                "   • Listen Address: {}:{}",
                if config.host.is_empty() { "<loopback>" } else { config.host.as_str() },
                config.port
            );
            println!("   • Log: {} ({:?})", config.log_level, config.log_format);
            println!(
                "   • Hang Report Interval: {}",
                humantime::format_duration(config.shutdown.hang_report_interval)
            );
            println!(
                "   • Unready On Shutdown: {}",
                config.shutdown.unready_on_shutdown
            );
            println!(
                "   • Invalid Transitions: {:?}",
                config.shutdown.invalid_transition_policy
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Use an IP literal for host (e.g. '127.0.0.1' or '::1')");
            println!("   • Use humantime durations (e.g. '5s', '1m 30s')");
            std::process::exit(1);
        }
    }
}
