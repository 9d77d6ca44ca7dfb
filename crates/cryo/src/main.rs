// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process entry points: `cryo bridge`, `cryo pid`, `cryo current`,
//! `cryo hemt`, `cryo magnet` (`SPEC_FULL.md` §2.1). Each subcommand is one
//! of the five long-running cooperating processes of `spec.md` §2.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

mod args;

use args::{AgentArgs, MagnetArgs};

#[derive(Parser)]
#[command(name = "cryo", version, about = "ADR cryostat control processes.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// SIM921 AC resistance bridge agent.
    Bridge(BridgeArgs),
    /// SIM960 PID analog controller agent.
    Pid(AgentArgs),
    /// currentduino current/heat-switch microcontroller agent.
    Current(AgentArgs),
    /// HEMT bias monitor microcontroller agent.
    Hemt(AgentArgs),
    /// Magnet cooldown state machine.
    Magnet(MagnetArgs),
}

#[derive(clap::Args)]
struct BridgeArgs {
    #[command(flatten)]
    agent: AgentArgs,

    /// Path to the calibration curve file currently installed on the bridge.
    #[arg(long, env = "CRYO_CURVE_PATH")]
    curve_path: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Bridge(args) => run_bridge(args).await,
        Commands::Pid(args) => run_pid(args).await,
        Commands::Current(args) => run_current(args).await,
        Commands::Hemt(args) => run_hemt(args).await,
        Commands::Magnet(args) => run_magnet(args).await,
    };

    if let Err(e) = result {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn shutdown_token() -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        child.cancel();
    });
    token
}

async fn run_bridge(args: BridgeArgs) -> anyhow::Result<()> {
    let curve = cryo_store::calibration::Curve::load(&args.curve_path)?;
    let instrument = cryo_instrument::bridge::Bridge::new(curve);
    cryo_instrument::runtime::run(instrument, args.agent.into(), shutdown_token()).await?;
    Ok(())
}

async fn run_pid(args: AgentArgs) -> anyhow::Result<()> {
    let instrument = cryo_instrument::pid::Pid::new();
    cryo_instrument::runtime::run(instrument, args.into(), shutdown_token()).await?;
    Ok(())
}

async fn run_current(args: AgentArgs) -> anyhow::Result<()> {
    let instrument = cryo_instrument::current::Currentduino::new();
    cryo_instrument::runtime::run(instrument, args.into(), shutdown_token()).await?;
    Ok(())
}

async fn run_hemt(args: AgentArgs) -> anyhow::Result<()> {
    let instrument = cryo_instrument::hemt::Hemt::new();
    cryo_instrument::runtime::run(instrument, args.into(), shutdown_token()).await?;
    Ok(())
}

async fn run_magnet(args: MagnetArgs) -> anyhow::Result<()> {
    let detector = if args.residual_detector {
        cryo_magnet::runtime::QuenchDetectorKind::Residual
    } else {
        cryo_magnet::runtime::QuenchDetectorKind::Slope { npoints: args.quench_npoints }
    };
    let config = cryo_magnet::runtime::RuntimeConfig {
        store_url: args.store_url,
        magnet: cryo_magnet::MagnetConfig {
            loop_interval: Duration::from_millis(args.tick_interval_ms),
            max_current_slope: args.max_current_slope,
            max_regulate_temp: args.max_regulate_temp,
            statefile: args.statefile,
        },
        quench_poll_interval: Duration::from_millis(args.quench_poll_interval_ms),
        quench_detector: detector,
    };
    cryo_magnet::runtime::run(config, shutdown_token()).await?;
    Ok(())
}
