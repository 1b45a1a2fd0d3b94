use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod replay;

#[zbus::proxy(
    interface = "org.freedesktop.VisageGuard1",
    default_service = "org.freedesktop.VisageGuard1",
    default_path = "/org/freedesktop/VisageGuard1"
)]
trait VisageGuard {
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn get_settings(&self) -> zbus::Result<String>;
    fn set_settings(&self, settings: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "visageguard", version, about = "Presence lock for the desktop session")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus.
    #[arg(
        long,
        global = true,
        env = "VISAGEGUARD_SYSTEM_BUS",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    system: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a detection session in the daemon.
    Start,
    /// Stop the running detection session.
    Stop,
    /// Show daemon and session status.
    Status,
    /// Show the policy settings, or replace them with --set.
    Settings {
        /// Complete settings object as JSON; missing keys take their defaults.
        #[arg(long, value_name = "JSON")]
        set: Option<String>,
    },
    /// Run the presence policy offline over a recorded landmark feed.
    Replay {
        /// JSON-lines feed; every record needs a t_ms timestamp.
        file: PathBuf,
        /// Policy settings file (TOML). Defaults apply when omitted.
        #[arg(long, value_name = "TOML")]
        settings: Option<PathBuf>,
    },
}

async fn connect(system: bool) -> Result<VisageGuardProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    VisageGuardProxy::new(&conn)
        .await
        .context("failed to reach visageguardd (is the daemon running?)")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Replay { file, settings } => replay::run(&file, settings.as_deref()),
        Command::Start => {
            connect(cli.system).await?.start().await.context("start failed")?;
            println!("detection started");
            Ok(())
        }
        Command::Stop => {
            if connect(cli.system).await?.stop().await.context("stop failed")? {
                println!("detection stopped");
            } else {
                println!("no detection session was running");
            }
            Ok(())
        }
        Command::Status => {
            let status = connect(cli.system).await?.status().await?;
            print_json(&status)
        }
        Command::Settings { set: Some(json) } => {
            // Fail fast on local typos before bothering the daemon.
            let policy: visageguard_core::PolicyConfig =
                serde_json::from_str(&json).context("settings must be a JSON object")?;
            policy.validate().context("invalid settings")?;

            let proxy = connect(cli.system).await?;
            proxy
                .set_settings(&json)
                .await
                .context("daemon rejected settings")?;
            print_json(&proxy.get_settings().await?)
        }
        Command::Settings { set: None } => {
            let settings = connect(cli.system).await?.get_settings().await?;
            print_json(&settings)
        }
    }
}
