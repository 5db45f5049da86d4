use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bytes requested per read from the child's output pipe.
pub const CHUNK_SIZE: usize = 4096;

/// Exit code reported when the process could not be run at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// Exit code reported when the process was terminated without one (e.g. by a signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Receives decoded output chunks while a command runs.
#[async_trait]
pub trait ChunkSink: Send {
    async fn on_chunk(&mut self, text: String);

    /// Called once the process has been spawned, before any output.
    async fn on_spawn(&mut self) {}
}

/// Collects every chunk in order. Handy for tests and one-shot callers.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub chunks: Vec<String>,
}

impl CollectSink {
    pub fn joined(&self) -> String {
        self.chunks.concat()
    }
}

#[async_trait]
impl ChunkSink for CollectSink {
    async fn on_chunk(&mut self, text: String) {
        self.chunks.push(text);
    }
}

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// `sh -c <line>`, used for free-form command lines.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// Incremental UTF-8 decoder for a byte stream that arrives in arbitrary pieces.
///
/// A multi-byte sequence cut off at the end of a read is held back and completed by the
/// next read; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence (0..=3).
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        let b = buf[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            return 0;
        };
        let have = buf.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

/// Run `cmd` to completion, streaming its combined stdout/stderr into `sink`.
///
/// - stdout and stderr share one pipe, so chunks keep the order the process wrote them in.
///   Each read of up to `CHUNK_SIZE` bytes is one chunk.
/// - Never fails: spawn and read errors become a diagnostic chunk and a non-zero exit code.
/// - Returns only after the pipe reached end-of-stream and the process has exited.
/// - Dropping the returned future kills the child.
pub async fn run_command<S: ChunkSink + ?Sized>(cmd: &CommandSpec, sink: &mut S) -> i32 {
    let (mut reader, stdout, stderr) = match output_pipe() {
        Ok(ends) => ends,
        Err(e) => {
            warn!(command = %cmd, error = %e, "failed to create output pipe");
            sink.on_chunk(format!("Error executing command: {e}\n")).await;
            return SPAWN_FAILURE_EXIT_CODE;
        }
    };

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }

    let spawned = command.spawn();
    // The command still owns our copies of the write end; EOF only arrives once they close.
    drop(command);
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %cmd, error = %e, "failed to spawn command");
            sink.on_chunk(spawn_diagnostic(&cmd.program, &e)).await;
            return SPAWN_FAILURE_EXIT_CODE;
        }
    };
    debug!(command = %cmd, pid = child.id(), "spawned command");
    sink.on_spawn().await;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut decoder = ChunkDecoder::default();
    let mut read_failed = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    sink.on_chunk(rest).await;
                }
                break;
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    sink.on_chunk(text).await;
                }
            }
            Err(e) => {
                read_failed = true;
                sink.on_chunk(format!("Error executing command: {e}\n")).await;
                break;
            }
        }
    }
    // a child still writing gets EPIPE instead of blocking on a full pipe
    drop(reader);

    match child.wait().await {
        Ok(status) => {
            let code = exit_code(status.code(), read_failed);
            debug!(command = %cmd, code, "command exited");
            code
        }
        Err(e) => {
            sink.on_chunk(format!("Error executing command: {e}\n")).await;
            SPAWN_FAILURE_EXIT_CODE
        }
    }
}

/// One pipe whose write end backs both stdout and stderr of the child.
fn output_pipe() -> io::Result<(pipe::Receiver, Stdio, Stdio)> {
    let (writer, reader) = pipe::pipe()?;
    let stdout = writer.into_blocking_fd()?;
    let stderr = stdout.try_clone()?;
    Ok((reader, Stdio::from(stdout), Stdio::from(stderr)))
}

/// Final exit code from the process status and whether reading its output failed.
///
/// A signal leaves no code and maps to `NO_EXIT_CODE`; a clean exit whose output could not
/// be read is still reported as a failure.
fn exit_code(status: Option<i32>, read_failed: bool) -> i32 {
    match status {
        Some(0) if read_failed => SPAWN_FAILURE_EXIT_CODE,
        Some(code) => code,
        None => NO_EXIT_CODE,
    }
}

fn spawn_diagnostic(program: &str, err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::NotFound {
        format!("Error: Command not found: {program}\n")
    } else {
        format!("Error executing command: {err}\n")
    }
}
