// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::cleanup;
use crate::motion::ReolinkProbe;
use crate::push::ChannelSink;
use crate::supervisor::Supervisor;
use base::clock::RealClocks;
use base::{bail_t, Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Runs the supervisor: stream transcoders, motion polling, frame
/// extraction, object detection, and disk cleanup.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(crate::parse_db_dir))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(args));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, the supervisor already awaited the
    //   children it cares about.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();

    r
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt())?;
        let term = signal(SignalKind::terminate())?;
        let usr2 = signal(SignalKind::user_defined2())?;
        let inner = inner(args, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("Received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("Received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = usr2.recv() => {
            info!("Received SIGUSR2; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail_t!(Cancelled, "immediate shutdown due to second signal (SIGINT)"),
        _ = term.recv() => bail_t!(Cancelled, "immediate shutdown due to second signal (SIGTERM)"),
        result = &mut inner => result,
    }
}

async fn inner(args: Args, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let (_db_lock, conn) = super::open_conn(&args.db_dir, super::OpenMode::ReadWrite)?;
    let db = Arc::new(db::Database::new(conn)?);
    info!("Database is loaded.");

    match crate::process::run_to_completion("ffmpeg", &["-version"], Duration::from_secs(5)).await
    {
        Ok(out) if out.code == Some(0) => {
            info!("Using {}", out.stdout.lines().next().unwrap_or("ffmpeg").trim());
        }
        Ok(out) => warn!(
            "ffmpeg -version exited with {:?}: {}",
            out.code,
            out.stderr.trim()
        ),
        Err(e) => warn!(
            "ffmpeg unavailable ({}); transcoding and extraction will fail",
            e.chain()
        ),
    }

    let push = Arc::new(ChannelSink::new(64));
    let mut push_rx = push.subscribe();
    tokio::spawn(async move {
        // Event visibility for operators until an HTTP layer subscribes.
        loop {
            match push_rx.recv().await {
                Ok(event) => tracing::trace!(%event, "push"),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    let probe = Arc::new(ReolinkProbe::new()?);
    let (mut supervisor, events_rx) =
        Supervisor::new(RealClocks::default(), db.clone(), push, probe);

    let cleaner = cleanup::Cleaner::new(db.clone(), Box::new(cleanup::StatvfsStats));
    let cleaner_join = tokio::spawn(cleaner.run(shutdown_rx.clone()));

    info!("Supervisor ready; ticking.");
    supervisor.run(events_rx, shutdown_rx).await;

    let _ = cleaner_join.await;
    info!("Exiting.");
    Ok(0)
}
