//! Live view of a connected session

use std::time::Duration;

use bench_comlink::SessionEvent;
use colored::*;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Print session events until Ctrl-C, `duration`, or link loss
pub async fn run<S, F>(
    mut events: broadcast::Receiver<SessionEvent<S>>,
    duration: Option<Duration>,
    cancel: &CancellationToken,
    mut render: F,
) where
    S: Clone,
    F: FnMut(&S),
{
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::DataUpdated(snapshot)) => render(&snapshot),
            Ok(SessionEvent::PollFailed(reason)) => {
                println!("{} {}", "poll failed:".yellow(), reason);
            },
            Ok(SessionEvent::Fault(summary)) => {
                println!("{} {}", "device fault:".red().bold(), summary);
            },
            Ok(SessionEvent::WatchdogTimeout { message, .. }) => {
                println!("{} {}", "watchdog:".red(), message);
            },
            Ok(SessionEvent::ConnectionLost(reason)) => {
                println!("{} {}", "connection lost:".red().bold(), reason);
                break;
            },
            Ok(SessionEvent::Connected { .. }) | Ok(SessionEvent::Disconnected) => {},
            Err(RecvError::Lagged(missed)) => {
                println!("{}", format!("skipped {} updates", missed).dimmed());
            },
            Err(RecvError::Closed) => break,
        }
    }
}
