//! `icepapctl`: command-line access to configured IcePAP/DEEP controllers.
//!
//! # Usage
//!
//! ```bash
//! icepapctl --config config/icepap.toml ping
//! icepapctl status th tth
//! icepapctl move th=1000 tth=2000
//! icepapctl raw crate1 "?VER"
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use icepap::config::{IcepapConfig, DEFAULT_CONFIG_PATH};
use icepap::group::DEFAULT_POLL_INTERVAL;
use icepap::logging::{self, OutputFormat, TracingConfig};
use icepap::{All, AxisMap, MotionSystem};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "icepapctl")]
#[command(about = "IcePAP / DEEP motion controller client", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format override (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every configured controller answers
    Ping,

    /// Send a raw command to one controller
    Raw {
        /// Controller name from the configuration
        controller: String,
        /// Command words, joined with spaces
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Show status words
    Status {
        /// Axis names; every axis when omitted
        axes: Vec<String>,
    },

    /// Show positions in steps
    Pos {
        /// Axis names; every axis when omitted
        axes: Vec<String>,
    },

    /// Move axes and wait for the end of motion
    Move {
        /// Targets as `axis=position`
        #[arg(required = true, num_args = 1..)]
        targets: Vec<String>,

        /// Return right after starting the motion
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop every configured axis
    Stop,

    /// Switch driver power
    Power {
        /// `on` or `off`
        state: String,
        /// Axis names; every axis when omitted
        axes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = IcepapConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_logging(&cli, &config)?;

    let system = MotionSystem::connect(&config)
        .await
        .context("failed to connect the motion system")?;
    let outcome = run(&cli, &system).await;
    system.close().await;
    outcome
}

fn init_logging(cli: &Cli, config: &IcepapConfig) -> Result<()> {
    let mut tracing_config = TracingConfig::from_config(config)?;
    if let Some(level) = &cli.log_level {
        tracing_config.level = logging::parse_log_level(level)?;
    }
    if let Some(format) = &cli.log_format {
        tracing_config.format = format.parse::<OutputFormat>()?;
    }
    logging::init(tracing_config)?;
    Ok(())
}

async fn run(cli: &Cli, system: &MotionSystem) -> Result<()> {
    match &cli.command {
        Commands::Ping => {
            let mut alive = serde_json::Map::new();
            for (name, controller) in system.controllers() {
                let ok = controller.is_alive().await?;
                alive.insert(name.to_string(), json!(ok));
                if !cli.json {
                    println!("{:<16} {}", name, if ok { "alive" } else { "NOT RESPONDING" });
                }
            }
            if cli.json {
                println!("{}", serde_json::Value::Object(alive));
            }
        }
        Commands::Raw { controller, command } => {
            let controller = system.controller(controller)?;
            let reply = controller.command(&command.join(" "), None).await?;
            match reply.text() {
                Some(text) if cli.json => println!("{}", json!({ "reply": text })),
                Some(text) => println!("{}", text),
                None => {}
            }
        }
        Commands::Status { axes } => {
            let statuses = system.select(axes)?.status(All).await?;
            print_map(cli.json, &statuses.map(|_, s| s.to_string()));
        }
        Commands::Pos { axes } => {
            let positions = system.select(axes)?.pos(All).await?;
            print_map(cli.json, &positions);
        }
        Commands::Move { targets, no_wait } => {
            let mut map = AxisMap::new();
            for target in targets {
                let Some((name, value)) = target.split_once('=') else {
                    bail!("expected axis=position, got \"{}\"", target);
                };
                let value: f64 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("bad position in \"{}\"", target))?;
                map.insert(system.axis(name.trim())?, value);
            }
            let group = system.select(&map.axes().iter().map(|a| a.name().to_string()).collect::<Vec<_>>())?;
            group.move_to(&map).await?;
            if !no_wait {
                group.wait_stopped(All, DEFAULT_POLL_INTERVAL).await?;
                print_map(cli.json, &group.pos(All).await?);
            }
        }
        Commands::Stop => {
            system.select(&[])?.stop(All).await?;
        }
        Commands::Power { state, axes } => {
            let on = match state.to_lowercase().as_str() {
                "on" => true,
                "off" => false,
                other => bail!("power state must be on or off, got \"{}\"", other),
            };
            let group = system.select(axes)?;
            group.set_power(on, All).await?;
            print_map(cli.json, &group.power(All).await?.map(|_, p| if p { "ON" } else { "OFF" }));
        }
    }
    Ok(())
}

fn print_map<T: std::fmt::Display + serde::Serialize>(as_json: bool, values: &AxisMap<T>) {
    if as_json {
        let object: serde_json::Map<String, serde_json::Value> = values
            .iter()
            .map(|(axis, value)| (axis.name().to_string(), json!(value)))
            .collect();
        println!("{}", serde_json::Value::Object(object));
    } else {
        for (axis, value) in values.iter() {
            println!("{:<16} {}", axis.name(), value);
        }
    }
}
