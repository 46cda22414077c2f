//! Line-oriented command protocol.
//!
//! Each input line is one command; each command produces exactly one output
//! line, either `ok ...`, a JSON document, or `error <message>`.
//!
//! ```text
//! start <id>
//! end <id>
//! end-all
//! gps <id|*> <lat> <long> [ts]
//! steps <id> <count> [ts]
//! sessions
//! show <id>
//! status
//! ```

use crate::session::{IngestTarget, SessionRegistry};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use trainlog_core::{TrainlogError, TrainlogResult};

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    End(String),
    EndAll,
    Gps {
        target: IngestTarget,
        lat: String,
        long: String,
        ts: Option<String>,
    },
    Steps {
        id: String,
        count: String,
        ts: Option<String>,
    },
    Sessions,
    Show(String),
    Status,
}

fn usage(msg: &str) -> TrainlogError {
    TrainlogError::Parse(format!("usage: {msg}"))
}

impl Command {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> TrainlogResult<Option<Command>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let words: Vec<&str> = line.split_whitespace().collect();

        let cmd = match words.as_slice() {
            ["start", id] => Command::Start(id.to_string()),
            ["start", ..] => return Err(usage("start <id>")),
            ["end", id] => Command::End(id.to_string()),
            ["end", ..] => return Err(usage("end <id>")),
            ["end-all"] => Command::EndAll,
            ["gps", target, lat, long, rest @ ..] if rest.len() <= 1 => Command::Gps {
                target: match *target {
                    "*" => IngestTarget::Broadcast,
                    id => IngestTarget::Session(id.to_string()),
                },
                lat: lat.to_string(),
                long: long.to_string(),
                ts: rest.first().map(|s| s.to_string()),
            },
            ["gps", ..] => return Err(usage("gps <id|*> <lat> <long> [ts]")),
            ["steps", id, count, rest @ ..] if rest.len() <= 1 => Command::Steps {
                id: id.to_string(),
                count: count.to_string(),
                ts: rest.first().map(|s| s.to_string()),
            },
            ["steps", ..] => return Err(usage("steps <id> <count> [ts]")),
            ["sessions"] => Command::Sessions,
            ["show", id] => Command::Show(id.to_string()),
            ["show", ..] => return Err(usage("show <id>")),
            ["status"] => Command::Status,
            [other, ..] => {
                return Err(TrainlogError::Parse(format!("unknown command: {other}")))
            }
            [] => return Ok(None),
        };
        Ok(Some(cmd))
    }

    /// Run the command against the registry and render the response.
    pub async fn execute(self, registry: &SessionRegistry) -> TrainlogResult<String> {
        match self {
            Command::Start(id) => {
                registry.start(&id).await?;
                Ok(format!("ok started {id}"))
            }
            Command::End(id) => {
                registry.end(&id).await?;
                Ok(format!("ok ended {id}"))
            }
            Command::EndAll => {
                let report = registry.end_all().await;
                let mut out = format!("ok ended {}", report.ended.len());
                if !report.failures.is_empty() {
                    let failed: Vec<String> = report
                        .failures
                        .iter()
                        .map(|(id, e)| format!("{id} ({e})"))
                        .collect();
                    out.push_str(&format!("; failed: {}", failed.join(", ")));
                }
                Ok(out)
            }
            Command::Gps {
                target,
                lat,
                long,
                ts,
            } => {
                let delivered = registry
                    .append_gps(target, ts.as_deref(), &lat, &long)
                    .await?;
                Ok(format!("ok delivered {delivered}"))
            }
            Command::Steps { id, count, ts } => {
                registry.append_step_count(&id, ts.as_deref(), &count).await?;
                Ok("ok".to_string())
            }
            Command::Sessions => to_json(&registry.store().list().await?),
            Command::Show(id) => to_json(&registry.store().read(&id).await?),
            Command::Status => to_json(&registry.list().await),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> TrainlogResult<String> {
    serde_json::to_string(value).map_err(|e| TrainlogError::Other(format!("json error: {e}")))
}

/// Read commands from `input` until EOF, writing one response line per command.
pub async fn serve<R, W>(registry: &SessionRegistry, input: R, mut output: W) -> TrainlogResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let response = match Command::parse(&line) {
            Ok(Some(cmd)) => {
                debug!(?cmd, "command");
                cmd.execute(registry).await
            }
            Ok(None) => continue,
            Err(e) => Err(e),
        };
        let mut text = match response {
            Ok(text) => text,
            Err(e) => format!("error {e}"),
        };
        text.push('\n');
        output.write_all(text.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}
