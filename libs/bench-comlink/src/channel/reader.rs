//! Response reader shared by the serial and TCP channels

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::{ResponseBoundary, MAX_RESPONSE_LEN};
use crate::error::{LinkError, Result};

const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadTiming {
    /// Deadline for the whole response
    pub timeout: Duration,
    /// Quiet gap that ends an idle-gap response
    pub settle: Duration,
}

/// Read one response according to `boundary`
///
/// Cancellation is checked before the deadline so an aborted call always
/// reports `Cancelled`, never `Timeout`.
pub(crate) async fn read_response<R>(
    reader: &mut R,
    boundary: ResponseBoundary,
    timing: ReadTiming,
    cancel: &CancellationToken,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let terminator = match boundary {
        ResponseBoundary::NoReply => return Ok(Vec::new()),
        ResponseBoundary::Terminator(byte) => Some((byte, None)),
        ResponseBoundary::EscapedTerminator { end, escape } => Some((end, Some(escape))),
        ResponseBoundary::IdleGap => None,
    };

    let deadline = Instant::now() + timing.timeout;
    let mut response = Vec::with_capacity(64);
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(if response.is_empty() {
                    LinkError::timeout(format!(
                        "no response within {} ms",
                        timing.timeout.as_millis()
                    ))
                } else {
                    LinkError::timeout(format!(
                        "incomplete response after {} ms ({} bytes)",
                        timing.timeout.as_millis(),
                        response.len()
                    ))
                });
            },
            read = reader.read(&mut chunk) => read?,
        };

        if n == 0 {
            return Err(LinkError::transport("connection closed by peer"));
        }
        append(&mut response, &chunk[..n])?;

        match terminator {
            Some((end, escape)) => {
                if ends_frame(&response, end, escape) {
                    return Ok(response);
                }
            },
            None => return drain_until_idle(reader, response, timing.settle, deadline, cancel).await,
        }
    }
}

/// Keep reading until the line is quiet for `settle`
async fn drain_until_idle<R>(
    reader: &mut R,
    mut response: Vec<u8>,
    settle: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = sleep_until(deadline) => return Ok(response),
            read = timeout(settle, reader.read(&mut chunk)) => read,
        };
        match read {
            // quiet for a full settle interval
            Err(_) => return Ok(response),
            Ok(Ok(0)) => return Ok(response),
            Ok(Ok(n)) => append(&mut response, &chunk[..n])?,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Last byte is `end` and not the escaped payload byte of a marker
fn ends_frame(response: &[u8], end: u8, escape: Option<u8>) -> bool {
    let Some((&last, before)) = response.split_last() else {
        return false;
    };
    if last != end {
        return false;
    }
    match escape {
        Some(escape) => {
            let markers = before.iter().rev().take_while(|&&b| b == escape).count();
            markers % 2 == 0
        },
        None => true,
    }
}

fn append(response: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    if response.len() + data.len() > MAX_RESPONSE_LEN {
        return Err(LinkError::frame(format!(
            "response exceeds {} bytes",
            MAX_RESPONSE_LEN
        )));
    }
    response.extend_from_slice(data);
    Ok(())
}
