//! Helper side of the terminal protocol, backed by a real PTY.
//!
//! Runs inside the `workspace-agent-pty-helper` process: reads
//! [`HelperCommand`]s from stdin, drives a `portable-pty` session and
//! writes [`HelperEvent`]s to stdout. Blocking I/O on dedicated threads;
//! no async runtime.

use std::{
    io::{BufRead, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
    time::Duration,
};

use anyhow::Context as _;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};

use crate::helper::{HelperCommand, HelperEvent, encode_line};

const READ_CHUNK: usize = 8192;
/// How long the exit path waits for buffered output to drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Serialized writer for protocol events.
pub struct Emitter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Emitter {
    #[must_use]
    pub fn new(out: impl Write + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(Box::new(out)),
        })
    }

    /// Write one event line.
    ///
    /// # Errors
    /// Returns error if the event cannot be written.
    pub fn emit(&self, event: &HelperEvent) -> anyhow::Result<()> {
        let line = encode_line(event)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

struct Terminal {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Serve the protocol on this process's stdin/stdout.
///
/// # Errors
/// Returns error if stdin or stdout fail.
pub fn serve_stdio() -> anyhow::Result<()> {
    let emitter = Emitter::new(std::io::stdout());
    serve(std::io::stdin().lock(), &emitter, |code| std::process::exit(code))
}

/// Serve the protocol until `input` ends.
///
/// `on_shell_exit` runs once the shell has exited and its exit event has
/// been written.
///
/// # Errors
/// Returns error if reading commands or writing events fails.
pub fn serve<F>(input: impl BufRead, emitter: &Arc<Emitter>, on_shell_exit: F) -> anyhow::Result<()>
where
    F: Fn(i32) + Send + Sync + Clone + 'static,
{
    emitter.emit(&HelperEvent::Ready)?;
    let mut terminal: Option<Terminal> = None;

    for line in input.lines() {
        let line = line.context("reading command")?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match serde_json::from_str::<HelperCommand>(&line) {
            Ok(command) => command,
            Err(e) => {
                emitter.emit(&HelperEvent::Error {
                    message: format!("invalid command: {e}"),
                })?;
                continue;
            }
        };

        match command {
            HelperCommand::Start {
                shell,
                cwd,
                cols,
                rows,
            } => {
                if terminal.is_some() {
                    emitter.emit(&HelperEvent::Error {
                        message: "session already started".into(),
                    })?;
                    continue;
                }
                match open_terminal(&shell, &cwd, cols, rows, emitter, on_shell_exit.clone()) {
                    Ok(opened) => terminal = Some(opened),
                    Err(e) => emitter.emit(&HelperEvent::Error {
                        message: format!("{e:#}"),
                    })?,
                }
            }
            HelperCommand::Input { data } => {
                if let Some(terminal) = terminal.as_mut() {
                    terminal.writer.write_all(data.as_bytes())?;
                    terminal.writer.flush()?;
                }
            }
            HelperCommand::Resize { cols, rows } => {
                if let Some(terminal) = terminal.as_ref() {
                    if let Err(e) = terminal.master.resize(pty_size(cols, rows)) {
                        emitter.emit(&HelperEvent::Error {
                            message: format!("resize failed: {e}"),
                        })?;
                    }
                }
            }
            HelperCommand::Stop => {
                if let Some(mut terminal) = terminal.take() {
                    let _ = terminal.killer.kill();
                }
            }
        }
    }

    if let Some(mut terminal) = terminal.take() {
        let _ = terminal.killer.kill();
    }
    Ok(())
}

const fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn resolve_cwd(cwd: &Path) -> PathBuf {
    if cwd.is_dir() {
        cwd.to_path_buf()
    } else {
        tracing::warn!(cwd = %cwd.display(), "Working directory missing, using home");
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    }
}

fn open_terminal<F>(
    shell: &str,
    cwd: &Path,
    cols: u16,
    rows: u16,
    emitter: &Arc<Emitter>,
    on_shell_exit: F,
) -> anyhow::Result<Terminal>
where
    F: Fn(i32) + Send + 'static,
{
    let pair = native_pty_system()
        .openpty(pty_size(cols, rows))
        .context("allocating pty")?;

    let mut command = CommandBuilder::new(shell);
    command.cwd(resolve_cwd(cwd));
    command.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(command)
        .with_context(|| format!("spawning {shell}"))?;
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair.master.try_clone_reader().context("cloning pty reader")?;
    let writer = pair.master.take_writer().context("taking pty writer")?;

    emitter.emit(&HelperEvent::Started {
        shell: shell.to_string(),
        pid,
    })?;

    let (drained_tx, drained_rx) = mpsc::channel::<()>();
    let pump_emitter = Arc::clone(emitter);
    thread::spawn(move || {
        pump_output(reader, &pump_emitter);
        let _ = drained_tx.send(());
    });

    let exit_emitter = Arc::clone(emitter);
    thread::spawn(move || {
        let exit_code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
            Err(e) => {
                tracing::warn!("waiting for shell failed: {e}");
                -1
            }
        };
        let _ = drained_rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT);
        let _ = exit_emitter.emit(&HelperEvent::Exit {
            exit_code: Some(exit_code),
            signal: None,
        });
        on_shell_exit(exit_code);
    });

    Ok(Terminal {
        master: pair.master,
        writer,
        killer,
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, emitter: &Emitter) {
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let data = drain_utf8(&mut pending);
                if !data.is_empty() && emitter.emit(&HelperEvent::Output { data }).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        let _ = emitter.emit(&HelperEvent::Output { data });
    }
}

/// Take the longest decodable prefix of `pending`, leaving an incomplete
/// trailing character for the next read. Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::with_capacity(pending.len());
    loop {
        let (valid, invalid) = match std::str::from_utf8(pending) {
            Ok(_) => (pending.len(), None),
            Err(e) => (e.valid_up_to(), e.error_len()),
        };
        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match invalid {
            Some(len) => {
                out.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + len);
            }
            None => {
                pending.drain(..valid);
                return out;
            }
        }
    }
}
