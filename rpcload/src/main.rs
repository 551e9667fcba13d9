use core::{future, time::Duration};
use std::{
    fs::File,
    io::{self, BufWriter},
    sync::Arc,
};

use anyhow::Error;
use clap::Parser;
use rpcload::{
    cfg::RunConfig,
    cmd::Cmd,
    printer,
    reporter::StopReason,
    runner::{Outcome, Requester},
    transport::GrpcDial,
};
use tokio::{runtime::Builder, sync::mpsc};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub fn main() {
    let cmd = Cmd::parse();
    if let Err(err) = rpcload::logging::init(cmd.verbose) {
        eprintln!("ERROR: failed to initialize logging: {err}");
    }

    if let Err(err) = run(cmd) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let cfg = RunConfig::try_from(cmd).map_err(|err| anyhow::anyhow!(err))?;
    let cfg = Arc::new(cfg);

    Builder::new_multi_thread()
        .worker_threads(cfg.cpus.get())
        .enable_io()
        .enable_time()
        .thread_name("rpcload")
        .build()?
        .block_on(execute(cfg))
}

async fn execute(cfg: Arc<RunConfig>) -> Result<(), Error> {
    let dial = GrpcDial::try_from(&*cfg)?;
    let requester = Requester::new(cfg.clone(), dial).await?;

    let (tx, rx) = mpsc::channel(1);
    spawn_stop_triggers(tx, cfg.duration);

    log::info!(
        "running {} requests to {} with concurrency {} over {} connection(s) ...",
        if cfg.duration.is_some() { "unbounded".to_string() } else { cfg.total.to_string() },
        cfg.host,
        cfg.concurrency,
        cfg.connections
    );

    let Outcome { report, errors } = requester.run(rx).await?;

    match &cfg.output {
        Some(path) => printer::print(&mut BufWriter::new(File::create(path)?), &report, cfg.format)?,
        None => printer::print(&mut io::stdout().lock(), &report, cfg.format)?,
    }

    match errors {
        Some(errors) => Err(rpcload::runner::Error::from(errors).into()),
        None => Ok(()),
    }
}

/// Wires Ctrl-C and the run duration into the stop channel.
///
/// Only the first trigger is delivered. Interrupting once more exits
/// immediately.
fn spawn_stop_triggers(tx: mpsc::Sender<StopReason>, duration: Option<Duration>) {
    tokio::spawn(async move {
        let timeout = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let reason = tokio::select! {
            rc = tokio::signal::ctrl_c() => match rc {
                Ok(()) => StopReason::Cancel,
                Err(err) => {
                    log::warn!("failed to listen for Ctrl-C: {err}");
                    (&mut timeout).await;
                    StopReason::Timeout
                }
            },
            () = &mut timeout => StopReason::Timeout,
        };

        log::info!("stopping ({reason}) ...");
        if tx.send(reason).await.is_err() {
            return;
        }
        drop(tx);

        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted again, exiting");
            std::process::exit(130);
        }
    });
}
