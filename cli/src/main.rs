mod arg_parser;

use anyhow::Context as _;
use arg_parser::{ArgParser, EncodeFrame, SubCommand};
use clap::Parser;
use screenjobs::screen::SimulatedScreen;
use screenjobs::{Config, Context, JobSpec, OwnerRef, RunPrivilege, Supervisor};
use std::path::Path;
use std::sync::Arc;
use wire::Frame;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = ArgParser::parse();
    match args.sub_command {
        SubCommand::Run {
            file,
            hardware,
            max_runtime,
        } => {
            let config = match &args.config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };
            run(config, &file, hardware, max_runtime).await?;
        }
        SubCommand::Decode { frame } => {
            let decoded = wire::decode(&frame.0)?;
            println!("{:?}", decoded);
        }
        SubCommand::Encode { frame } => {
            let frame = match frame {
                EncodeFrame::Fill { color } => Frame::Fill { color },
                EncodeFrame::SetPixel { index, color } => Frame::SetPixel { index, color },
                EncodeFrame::Clear => Frame::Clear,
                EncodeFrame::Render => Frame::Render,
            };
            let hex: String = frame.encode().iter().map(|b| format!("{:02x}", b)).collect();
            println!("{}", hex);
        }
    }

    Ok(())
}

/// Create a job for `file`, run it once, print its run log and remove it.
async fn run(
    config: Config,
    file: &Path,
    hardware: bool,
    max_runtime: Option<u64>,
) -> anyhow::Result<()> {
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    for dir in [
        &config.sandbox.envs_dir,
        &config.sandbox.storage_dir,
        &config.sandbox.run_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let screen = Arc::new(SimulatedScreen::new(
        config.screen.width,
        config.screen.height,
    ));
    let ctx = Context::in_memory(config, screen.clone());
    let supervisor = Supervisor::spawn(ctx.clone(), 16);

    let job = ctx
        .registry
        .create(JobSpec {
            owner: std::env::var("USER").ok().map(OwnerRef),
            run_privilege: if hardware {
                RunPrivilege::Hardware
            } else {
                RunPrivilege::Simulate
            },
            max_runtime_secs: max_runtime,
            code: Some(code),
        })
        .await?;

    let handle = match supervisor.run(&job, None).await {
        Ok(handle) => handle,
        Err(refused) => {
            if let Err(e) = supervisor.remove(&job).await {
                tracing::warn!(error = %e, "could not remove job");
            }
            return Err(refused.into());
        }
    };
    let run_id = handle.run_id;
    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            supervisor.stop(run_id, true).await?;
            wait.await?
        }
    };

    if let Some(entry) = ctx.ledger.get(&outcome.run_id) {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    }
    tracing::info!(
        renders = screen.render_count(),
        elapsed = ?outcome.elapsed,
        "run finished"
    );
    supervisor.remove(&job).await?;
    Ok(())
}
