/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{Args, Parser, Subcommand};
use sandboxd::sandboxd::bootstrap::Manifest;
use sandboxd::sandboxd::clock::SystemClock;
use sandboxd::sandboxd::config::{Config, ControllerConfig};
use sandboxd::sandboxd::controller::manager::ControllerManager;
use sandboxd::sandboxd::k8s::store::{Client, InMemoryApi};
use sandboxd::sandboxd::kubelet::SimulatedKubelet;
use sandboxd::sandboxd::logger::{self, log_error, log_info, LogFormat, LogLevel};
use sandboxd::sandboxd::observability::health::HealthProbe;
use sandboxd::sandboxd::observability::tracing;
use sandboxd::sandboxd::server;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Controllers for pooled agent sandboxes.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers against an in-memory platform
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Address serving /metrics and the health probes
    #[arg(long, value_name = "ADDR")]
    metrics_bind_address: Option<SocketAddr>,

    /// Log line format: text or json
    #[arg(long)]
    log_format: Option<String>,

    /// Minimum log level: debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between full resyncs
    #[arg(long)]
    resync_seconds: Option<u64>,

    /// Seconds a claimed sandbox has to become ready
    #[arg(long)]
    ready_timeout_seconds: Option<u64>,

    /// Reconcile workers per controller
    #[arg(long)]
    workers: Option<usize>,

    /// Delay before the simulated node agent reports a pod ready
    #[arg(long, default_value_t = 500)]
    pod_startup_delay_ms: u64,

    /// JSON manifest of templates, warm pools and claims to create at startup
    #[arg(long, value_name = "PATH")]
    manifest: Option<PathBuf>,
}

type BoxError = Box<dyn Error + Send + Sync>;

fn configure_logging(args: &RunArgs) -> Result<(), BoxError> {
    let format: LogFormat = match args.log_format.as_deref() {
        Some(value) => value.parse()?,
        None => Config::LogFormat.parse()?,
    };
    let level: LogLevel = match args.log_level.as_deref() {
        Some(value) => value.parse()?,
        None => Config::LogLevel.parse()?,
    };
    logger::set_log_format(format);
    logger::set_min_level(level);
    Ok(())
}

fn controller_config(args: &RunArgs) -> Result<ControllerConfig, BoxError> {
    let mut config = ControllerConfig::from_env()?;
    if let Some(seconds) = args.resync_seconds {
        config.resync_interval = Duration::from_secs(seconds);
    }
    if let Some(seconds) = args.ready_timeout_seconds {
        config.ready_timeout = Duration::from_secs(seconds);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<(), BoxError> {
    configure_logging(&args)?;
    tracing::init();
    let config = controller_config(&args)?;
    let metrics_addr: SocketAddr = match args.metrics_bind_address {
        Some(addr) => addr,
        None => Config::MetricsAddress.parse()?,
    };

    let client = Client::new(Arc::new(InMemoryApi::new()));
    if let Some(path) = args.manifest.as_deref() {
        let created = Manifest::load(path)?.apply(&client)?;
        log_info(
            "sandboxd",
            "applied manifest",
            &[("path", &path.display().to_string()), ("created", &created.to_string())],
        );
    }

    let manager = ControllerManager::new(client.clone(), config, Arc::new(SystemClock));
    let shutdown = manager.shutdown_token();
    let probe = HealthProbe::new(client.clone());

    let mut handles = manager.start();
    handles.push(
        SimulatedKubelet::new(client, Duration::from_millis(args.pod_startup_delay_ms))
            .spawn(shutdown.clone()),
    );
    probe.set_controllers_running(true);

    let mut http = tokio::spawn(server::serve(metrics_addr, probe.clone(), shutdown.clone()));

    let mut served = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            log_info("sandboxd", "shutting down", &[]);
        }
        finished = &mut http => served = Some(finished),
    }

    probe.set_controllers_running(false);
    manager.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    let served = match served {
        Some(finished) => finished,
        None => http.await,
    };
    served??;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error("sandboxd", "fatal error", &[("error", &err.to_string())]);
            ExitCode::FAILURE
        }
    }
}
