//! Line-oriented intake: one JSON object per line, either an envelope to
//! process or a run to install.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::relay::{Envelope, Outcome, Relay};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Envelope(Envelope),
    Run(RunConfig),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    pub processed: usize,
    pub skipped: usize,
    /// Onions still waiting for a run when input ended.
    pub abandoned: usize,
}

impl IntakeSummary {
    fn record(&mut self, finished: Result<Outcome, JoinError>) {
        match finished {
            Ok(outcome) => {
                self.processed += 1;
                info!(?outcome, "processed");
            }
            Err(err) => warn!(error = %err, "receive task failed"),
        }
    }
}

/// Feed every line of `reader` to `relay` until EOF, then wait for the
/// receives in flight. Without an installed run nothing in flight can make
/// progress, so those receives are aborted instead.
pub async fn serve_lines<R>(relay: Arc<Relay>, reader: R) -> std::io::Result<IntakeSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IntakeSummary::default();
    let mut pending = JoinSet::new();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        while let Some(finished) = pending.try_join_next() {
            summary.record(finished);
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Input>(&line) {
            Ok(Input::Envelope(envelope)) => {
                let relay = Arc::clone(&relay);
                pending.spawn(async move { relay.receive(envelope).await });
            }
            Ok(Input::Run(run)) => {
                if let Err(err) = relay.start_run(&run) {
                    summary.skipped += 1;
                    warn!(error = %err, "rejected run configuration");
                }
            }
            Err(err) => {
                summary.skipped += 1;
                warn!(error = %err, "skipping malformed input line");
            }
        }
    }

    if relay.current_run().is_none() {
        summary.abandoned = pending.len();
        if summary.abandoned > 0 {
            warn!(abandoned = summary.abandoned, "input ended before any run was installed");
        }
        pending.abort_all();
        return Ok(summary);
    }

    while let Some(finished) = pending.join_next().await {
        summary.record(finished);
    }
    Ok(summary)
}
