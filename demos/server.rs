// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use asprof_pprof::CpuProfiler;
use clap::Parser;

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer().pretty();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

/// Simple server to test the profiling endpoint against
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value_t = 4001)]
    port: u16,
}

// something for the profiler to see
fn spin(rounds: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..rounds {
        acc = acc.wrapping_mul(31).wrapping_add(i);
    }
    acc
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    set_up_tracing();

    let args = Args::parse();

    tokio::spawn(async {
        loop {
            let acc = tokio::task::spawn_blocking(|| spin(50_000_000)).await;
            tracing::debug!(?acc, "burned some cpu");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });

    let profiler = Arc::new(CpuProfiler::new()?);
    let app = asprof_pprof::endpoint::router(profiler);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!(port = args.port, "serving /debug/pprof/profile");
    axum::serve(listener, app).await?;
    Ok(())
}
