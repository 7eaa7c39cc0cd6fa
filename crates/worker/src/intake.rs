use seenmark_domain::seen_batch::SeenEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// Reads newline-delimited JSON events and forwards them to the intake
/// channel. Returns the number forwarded once the input ends or the channel
/// closes. Malformed lines are logged and skipped.
pub async fn forward_event_lines<R>(
    input: R,
    events: mpsc::Sender<SeenEvent>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut forwarded = 0;
    while let Some(line) = lines.next_line().await? {
        let Some(decoded) = decode_event_line(&line) else {
            continue;
        };
        match decoded {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    tracing::warn!("seen intake closed; stopping event input");
                    break;
                }
                forwarded += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed seen event line");
            }
        }
    }
    Ok(forwarded)
}

fn decode_event_line(line: &str) -> Option<serde_json::Result<SeenEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}
