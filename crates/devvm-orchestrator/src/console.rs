//! Interactive console attachment.
//!
//! Local keystrokes are relayed to the instance's console, with two escape
//! sequences handled locally: Ctrl+C ends the session and asks the caller to
//! stop the instance, Ctrl+P Ctrl+Q detaches and leaves it running. When the
//! instance closes its console the session simply ends.

use std::io::{self, IsTerminal};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use devvm_common::{DevVmError, Result};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::engine::{ConsoleChunk, ConsoleStream, ContainerEngine};

const CTRL_C: u8 = 0x03;
const CTRL_P: u8 = 0x10;
const CTRL_Q: u8 = 0x11;

/// How an attached session ended.
#[derive(Debug)]
pub enum AttachOutcome {
    /// The user pressed Ctrl+C. The caller should stop the instance.
    Stopped,
    /// The user pressed Ctrl+P Ctrl+Q. The instance keeps running.
    Detached,
    /// The instance closed its console, e.g. the guest powered off. Nothing
    /// was requested, so the instance is left as it is.
    Ended,
    /// The connection failed while neither stopping nor detaching.
    Errored(DevVmError),
}

/// Restores the terminal's previous mode when dropped.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { _private: () })
    }

    /// Raw mode only when stdin is a real terminal.
    pub fn for_stdin() -> io::Result<Option<Self>> {
        if io::stdin().is_terminal() {
            Self::new().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Send these bytes to the console (may be empty).
    Forward(Vec<u8>),
    Stop,
    Detach,
}

/// Recognises the escape sequences in chunks read from local input.
///
/// Sequences are matched per chunk: a raw terminal delivers one keystroke per
/// read, so a control key arrives as a chunk of exactly one byte.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    pending_ctrl_p: bool,
}

impl EscapeFilter {
    pub fn feed(&mut self, chunk: &[u8]) -> InputAction {
        match chunk {
            [] => InputAction::Forward(Vec::new()),
            // A held Ctrl+P is dropped.
            [CTRL_C] => InputAction::Stop,
            [CTRL_Q] if self.pending_ctrl_p => InputAction::Detach,
            [CTRL_P] => {
                // A second Ctrl+P releases the first and is held in its place.
                let flushed = if self.pending_ctrl_p {
                    vec![CTRL_P]
                } else {
                    Vec::new()
                };
                self.pending_ctrl_p = true;
                InputAction::Forward(flushed)
            }
            _ => {
                let mut bytes = Vec::with_capacity(chunk.len() + 1);
                if std::mem::take(&mut self.pending_ctrl_p) {
                    bytes.push(CTRL_P);
                }
                bytes.extend_from_slice(chunk);
                InputAction::Forward(bytes)
            }
        }
    }

    pub fn is_holding(&self) -> bool {
        self.pending_ctrl_p
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes).await?;
    out.flush().await
}

/// Relay between `local_input` and the console until one side ends the session.
///
/// Stdout and console chunks go to `stdout`; stderr chunks, which only exist
/// for containers without a TTY, go to `stderr`.
pub async fn run_console_session<I, O, E>(
    console: ConsoleStream,
    mut local_input: I,
    stdout: &mut O,
    stderr: &mut E,
) -> AttachOutcome
where
    I: Stream<Item = io::Result<Vec<u8>>> + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let ConsoleStream {
        mut output,
        mut input,
    } = console;
    let mut filter = EscapeFilter::default();
    let mut local_open = true;

    loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(ConsoleChunk::Stdout(bytes) | ConsoleChunk::Console(bytes))) => {
                    if let Err(e) = write_chunk(stdout, &bytes).await {
                        return AttachOutcome::Errored(e.into());
                    }
                }
                Some(Ok(ConsoleChunk::Stderr(bytes))) => {
                    if let Err(e) = write_chunk(stderr, &bytes).await {
                        return AttachOutcome::Errored(e.into());
                    }
                }
                Some(Err(e)) => return AttachOutcome::Errored(e.into()),
                None => {
                    debug!("Console closed by instance");
                    return AttachOutcome::Ended;
                }
            },
            read = local_input.next(), if local_open => match read {
                Some(Ok(chunk)) => match filter.feed(&chunk) {
                    InputAction::Forward(bytes) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        if let Err(e) = write_chunk(&mut input, &bytes).await {
                            return AttachOutcome::Errored(e.into());
                        }
                    }
                    InputAction::Stop => {
                        close_input(&mut input).await;
                        return AttachOutcome::Stopped;
                    }
                    InputAction::Detach => {
                        close_input(&mut input).await;
                        return AttachOutcome::Detached;
                    }
                },
                Some(Err(e)) => return AttachOutcome::Errored(e.into()),
                None => {
                    // Piped input ran out; keep showing output.
                    debug!("Local input closed");
                    local_open = false;
                }
            },
        }
    }
}

/// Errors while closing on a stop or detach are part of a normal close.
async fn close_input<W: AsyncWrite + Unpin + ?Sized>(input: &mut W) {
    if let Err(e) = input.shutdown().await {
        debug!(error = %e, "Console input already closed");
    }
}

/// Chunks of this process's stdin, one per read.
pub fn stdin_chunks() -> impl Stream<Item = io::Result<Vec<u8>>> + Unpin + Send {
    Box::pin(futures::stream::unfold(
        tokio::io::stdin(),
        |mut stdin| async move {
            let mut buf = vec![0u8; 1024];
            match stdin.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), stdin))
                }
                Err(e) => Some((Err(e), stdin)),
            }
        },
    ))
}

/// Attach the local terminal to a running instance's console.
///
/// The terminal is in raw mode only for the duration of the call.
#[instrument(skip(engine))]
pub async fn attach<E: ContainerEngine + ?Sized>(
    engine: &E,
    container_id: &str,
) -> Result<AttachOutcome> {
    let record = engine.inspect_container(container_id).await?;
    if !record.running {
        return Err(DevVmError::validation(
            format!("Instance {} is not running", record.name),
            "Start it before attaching",
        ));
    }
    let console = engine.attach_container(container_id).await?;

    let _raw_mode = RawModeGuard::for_stdin()?;
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let outcome = run_console_session(console, stdin_chunks(), &mut stdout, &mut stderr).await;
    debug!(?outcome, "Console session ended");
    Ok(outcome)
}
