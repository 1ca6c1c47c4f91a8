//! Build-progress protocol relay.
//!
//! The daemon reports build progress as newline-delimited JSON messages.
//! Messages are consumed strictly in arrival order; an embedded error event
//! terminates the build even when output is being discarded, so the stream
//! is always drained.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use kiln_common::{KilnError, KilnResult};
use serde::Deserialize;

/// One structured progress event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressMessage {
    /// Raw output stream fragment.
    #[serde(default)]
    pub stream: Option<String>,
    /// Short status line.
    #[serde(default)]
    pub status: Option<String>,
    /// Identifier of the layer/step the status applies to.
    #[serde(default)]
    pub id: Option<String>,
    /// Rendered progress bar fragment.
    #[serde(default)]
    pub progress: Option<String>,
    /// Error string (legacy field).
    #[serde(default)]
    pub error: Option<String>,
    /// Structured error detail.
    #[serde(rename = "errorDetail", default)]
    pub error_detail: Option<ErrorDetail>,
}

/// Structured error embedded in the progress protocol.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    /// Error message.
    #[serde(default)]
    pub message: String,
}

/// Where relayed progress goes.
#[derive(Debug, Clone, Copy)]
pub enum ProgressSink {
    /// Drop output, still drain the stream.
    Discard,
    /// Write to stderr, optionally with interactive in-place updates.
    Stderr {
        /// Whether stderr is a user-attended terminal.
        interactive: bool,
    },
}

impl ProgressSink {
    /// Sink for a verbosity setting. Terminal capabilities are probed only
    /// when output actually goes to stderr.
    #[must_use]
    pub fn for_verbosity(verbose: bool) -> Self {
        if verbose {
            Self::Stderr {
                interactive: console::user_attended_stderr(),
            }
        } else {
            Self::Discard
        }
    }
}

/// Relay a progress byte stream to a sink.
///
/// Returns the build's terminal error when the protocol embeds one,
/// distinct from transport errors on the stream itself.
pub async fn relay<S>(mut stream: S, sink: ProgressSink) -> KilnResult<()>
where
    S: Stream<Item = KilnResult<Bytes>> + Unpin,
{
    let term = console::Term::stderr();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            handle_line(&line, sink, &term)?;
        }
    }
    if !buffer.is_empty() {
        handle_line(&buffer, sink, &term)?;
    }
    Ok(())
}

fn handle_line(raw: &[u8], sink: ProgressSink, term: &console::Term) -> KilnResult<()> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let Ok(message) = serde_json::from_str::<ProgressMessage>(line) else {
        // Non-JSON noise is relayed verbatim when output is wanted.
        if let ProgressSink::Stderr { .. } = sink {
            eprintln!("{line}");
        }
        return Ok(());
    };

    if let Some(detail) = &message.error_detail {
        return Err(KilnError::BuildFailed {
            message: detail.message.clone(),
        });
    }
    if let Some(error) = &message.error {
        return Err(KilnError::BuildFailed {
            message: error.clone(),
        });
    }

    match sink {
        ProgressSink::Discard => Ok(()),
        ProgressSink::Stderr { interactive } => render(&message, interactive, term),
    }
}

fn render(message: &ProgressMessage, interactive: bool, term: &console::Term) -> KilnResult<()> {
    if let Some(stream) = &message.stream {
        eprint!("{stream}");
        return Ok(());
    }
    if let Some(status) = &message.status {
        let mut line = String::new();
        if let Some(id) = &message.id {
            line.push_str(id);
            line.push_str(": ");
        }
        line.push_str(status);
        if let Some(progress) = &message.progress {
            line.push(' ');
            line.push_str(progress);
        }
        if interactive {
            term.clear_line()?;
            term.write_str(&line)?;
        } else {
            eprintln!("{line}");
        }
    }
    Ok(())
}
