//! A shell attached to a PTY, with raw byte I/O and window-size control.
//!
//! ## Threads
//!
//! PTY reads and writes are blocking syscalls, so neither runs on the async
//! scheduler:
//!
//! - The **reader** thread pulls chunks (at most `max_chunk` bytes) from the
//!   master into a bounded channel, surfaced as [`PtyOutput`].
//! - The **deputy** thread owns the master write side. It receives raw
//!   [`Command`] frames over a private channel and applies them: `Data` is
//!   written, `Resize` issues `TIOCSWINSZ`, `Stop` writes EOT and exits.
//!   A slow or blocked write stalls only the deputy.
//!
//! The master is non-blocking and both threads `poll` it together with a
//! wake pipe. Once the shell has been reaped, every process left in its
//! session is killed and the pipe's write end is closed, so both threads
//! return and the master is released even if something still holds the
//! slave.
//!
//! The shell itself runs as a separate process and session leader, so its
//! process group can be signalled as a whole on [`PtySession::stop`].

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpid, getsid, pipe2, Pid};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::pty::{self, InheritedTerminal};
use crate::protocol::Command;

/// End-of-transmission (Ctrl-D), written to the master on stop.
const EOT: u8 = 0x04;

/// Output chunks buffered between the reader thread and the consumer.
const OUTPUT_QUEUE: usize = 64;

/// Reads the reader makes after being woken, to flush what is already
/// buffered on the master.
const DRAIN_READS: usize = 64;

/// Why a PTY session could not be created.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate PTY: {0}")]
    Allocate(#[from] nix::Error),
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        source: std::io::Error,
    },
    #[error("failed to start PTY thread: {0}")]
    Thread(std::io::Error),
    #[error("PTY session is closed")]
    Closed,
}

/// Parameters for [`PtySession::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell binary to execute.
    pub shell: String,
    /// Largest chunk handed out by [`PtyOutput::next`].
    pub max_chunk: usize,
    /// Window size used when the worker has no terminal of its own.
    pub rows: u16,
    pub cols: u16,
    /// How long `stop` waits after each step (EOT, SIGHUP) before escalating.
    pub stop_grace: Duration,
}

/// Handle to one running shell. Dropping it kills the process group.
pub struct PtySession {
    session_id: String,
    pid: Option<u32>,
    deputy_tx: mpsc::UnboundedSender<Vec<u8>>,
    exit_rx: watch::Receiver<Option<i32>>,
    stopped_tx: watch::Sender<bool>,
    stop_requested: AtomicBool,
    stop_grace: Duration,
    io_threads: Arc<AtomicUsize>,
}

/// Finite sequence of output chunks from the PTY master.
///
/// Ends when the reader hits EOF or an error (child exited, PTY closed), or
/// once [`PtySession::stop`] has completed. It never restarts.
pub struct PtyOutput {
    rx: mpsc::Receiver<Vec<u8>>,
    stopped_rx: watch::Receiver<bool>,
    done: bool,
}

impl PtySession {
    /// Allocate a PTY, start the shell on it, and start the reader and deputy
    /// threads.
    pub fn spawn(session_id: &str, opts: &SpawnOptions) -> Result<(Self, PtyOutput), PtyError> {
        let inherited = InheritedTerminal::capture();
        let (rows, cols) = inherited.map_or((opts.rows, opts.cols), |t| (t.rows(), t.cols()));

        let pair = pty::allocate_pty(rows, cols)?;
        let mut child =
            pty::spawn_shell_pty(&pair, &opts.shell, inherited).map_err(|source| {
                PtyError::Spawn {
                    shell: opts.shell.clone(),
                    source,
                }
            })?;
        let pid = child.id();
        // Only the child keeps the slave open; EOF on the master then means
        // the shell (and everything it started on this terminal) is gone.
        drop(pair.slave);

        pty::set_nonblocking(&pair.master)?;
        let reader = pair.master.try_clone().map_err(PtyError::Thread)?;
        let writer = pair.master;
        let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC)?;
        let deputy_wake = wake_rx.try_clone().map_err(PtyError::Thread)?;
        let io_threads = Arc::new(AtomicUsize::new(0));

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        let max_chunk = opts.max_chunk.max(1);
        let sid = session_id.to_string();
        let guard = IoThread::enter(&io_threads);
        std::thread::Builder::new()
            .name(format!("pty-read-{session_id}"))
            .spawn(move || {
                read_loop(&sid, File::from(reader), &wake_rx, &out_tx, max_chunk);
                drop(guard);
            })
            .map_err(PtyError::Thread)?;

        let (deputy_tx, deputy_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sid = session_id.to_string();
        let guard = IoThread::enter(&io_threads);
        std::thread::Builder::new()
            .name(format!("pty-deputy-{session_id}"))
            .spawn(move || {
                deputy_loop(&sid, File::from(writer), &deputy_wake, deputy_rx);
                drop(guard);
            })
            .map_err(PtyError::Thread)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let sid = session_id.to_string();
        let deputy_stop = deputy_tx.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(session_id = %sid, "PTY child wait error: {e}");
                    -1
                }
            };
            info!(session_id = %sid, "Shell exited with code {code}");
            if let Some(pid) = pid {
                let killed = kill_session(pid);
                if killed > 0 {
                    info!(session_id = %sid, "Killed {killed} processes left in the shell's session");
                }
            }
            // Release the master: the deputy leaves on Stop, both threads
            // leave their poll once the wake pipe closes.
            let _ = deputy_stop.send(Command::Stop.encode());
            drop(wake_tx);
            let _ = exit_tx.send(Some(code));
        });

        let (stopped_tx, stopped_rx) = watch::channel(false);
        info!(session_id, shell = %opts.shell, pid, "PTY session started");

        Ok((
            Self {
                session_id: session_id.to_string(),
                pid,
                deputy_tx,
                exit_rx,
                stopped_tx,
                stop_requested: AtomicBool::new(false),
                stop_grace: opts.stop_grace,
                io_threads,
            },
            PtyOutput {
                rx: out_rx,
                stopped_rx,
                done: false,
            },
        ))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// OS process id of the shell.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the shell process is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Whether [`PtySession::stop`] has been called. Output that ends after
    /// this is set ended because of the stop.
    pub fn was_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Reader and deputy threads still holding the PTY master.
    pub fn io_threads(&self) -> usize {
        self.io_threads.load(Ordering::Acquire)
    }

    /// Exit code once the shell has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Queue raw bytes for the shell's stdin.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.send_frame(Command::Data(data.to_vec()).encode())
    }

    /// Change the PTY window size.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.send_frame(Command::Resize { rows, cols }.encode())
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), PtyError> {
        self.deputy_tx.send(frame).map_err(|_| PtyError::Closed)
    }

    /// Write EOT, release the PTY and terminate the shell.
    ///
    /// Escalates EOT → SIGHUP → SIGKILL on the shell's process group, waiting
    /// `stop_grace` between steps. When this returns the child has been
    /// reaped, the rest of its session killed, the I/O threads told to let go
    /// of the master and the paired [`PtyOutput`] has ended. Calling it again
    /// is a no-op.
    pub async fn stop(&self) {
        if *self.stopped_tx.borrow() {
            return;
        }
        self.stop_requested.store(true, Ordering::Release);
        // Deputy may already be gone if the shell exited on its own.
        let _ = self.deputy_tx.send(Command::Stop.encode());

        let mut exit_rx = self.exit_rx.clone();
        if !self.wait_exit(&mut exit_rx, self.stop_grace).await {
            debug!(session_id = %self.session_id, "Shell ignored EOT, sending SIGHUP");
            self.signal_group(Signal::SIGHUP);
            if !self.wait_exit(&mut exit_rx, self.stop_grace).await {
                warn!(session_id = %self.session_id, "Shell ignored SIGHUP, sending SIGKILL");
                self.signal_group(Signal::SIGKILL);
                // SIGKILL cannot be ignored; the wait only covers reaping.
                let _ = exit_rx.wait_for(Option::is_some).await;
            }
        }

        let _ = self.stopped_tx.send(true);
        info!(session_id = %self.session_id, "PTY session stopped");
    }

    async fn wait_exit(&self, exit_rx: &mut watch::Receiver<Option<i32>>, limit: Duration) -> bool {
        matches!(
            tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        )
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else { return };
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, signal) {
            debug!(session_id = %self.session_id, "killpg({pgid}, {signal}) failed: {e}");
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.is_running() {
            self.signal_group(Signal::SIGKILL);
        }
    }
}

impl PtyOutput {
    /// Next chunk of output, or `None` once the session has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        let chunk = tokio::select! {
            biased;
            chunk = self.rx.recv() => chunk,
            _ = self.stopped_rx.wait_for(|stopped| *stopped) => None,
        };
        if chunk.is_none() {
            self.done = true;
        }
        chunk
    }
}

/// Counts a live I/O thread until dropped.
struct IoThread(Arc<AtomicUsize>);

impl IoThread {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(count))
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Readiness {
    Ready,
    Woken,
}

/// Block until `fd` has `events` or the wake pipe is closed.
fn wait_ready(fd: &impl AsFd, wake: &OwnedFd, events: PollFlags) -> Readiness {
    loop {
        let mut fds = [
            PollFd::new(fd.as_fd(), events),
            PollFd::new(wake.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {
                if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                    return Readiness::Woken;
                }
                if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                    return Readiness::Ready;
                }
            }
            Err(Errno::EINTR) => {}
            Err(_) => return Readiness::Woken,
        }
    }
}

/// SIGKILL every process whose session id is `sid`. Returns how many were
/// signalled.
fn kill_session(sid: u32) -> usize {
    #[allow(clippy::cast_possible_wrap)]
    let sid = Pid::from_raw(sid as i32);
    let me = getpid();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .filter(|&pid| pid != me && getsid(Some(pid)) == Ok(sid))
        .filter(|&pid| kill(pid, Signal::SIGKILL).is_ok())
        .count()
}

fn read_loop(
    session_id: &str,
    mut master: File,
    wake: &OwnedFd,
    out_tx: &mpsc::Sender<Vec<u8>>,
    max_chunk: usize,
) {
    let mut buf = vec![0u8; max_chunk];
    let mut budget = None;
    loop {
        if budget == Some(0) {
            break;
        }
        if budget.is_none() {
            if let Readiness::Woken = wait_ready(&master, wake, PollFlags::POLLIN) {
                budget = Some(DRAIN_READS);
            }
        }
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock && budget.is_none() => {}
            // EIO once the slave side is fully closed; WouldBlock while
            // draining means nothing is left.
            Err(_) => break,
        }
        budget = budget.map(|n: usize| n - 1);
    }
    debug!(session_id, "PTY reader finished");
}

/// Write all of `data` to the non-blocking master, waiting for room.
fn write_all(master: &mut File, wake: &OwnedFd, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match master.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if let Readiness::Woken = wait_ready(&*master, wake, PollFlags::POLLOUT) {
                    return Err(ErrorKind::BrokenPipe.into());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn deputy_loop(
    session_id: &str,
    mut master: File,
    wake: &OwnedFd,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.blocking_recv() {
        match Command::decode(&frame) {
            Ok(Command::Data(data)) => {
                if let Err(e) = write_all(&mut master, wake, &data) {
                    debug!(session_id, "PTY write failed: {e}");
                    break;
                }
            }
            Ok(Command::Resize { rows, cols }) => {
                if let Err(e) = pty::resize_pty(&master, rows, cols) {
                    warn!(session_id, rows, cols, "PTY resize failed: {e}");
                }
            }
            Ok(Command::Stop) => {
                let _ = write_all(&mut master, wake, &[EOT]);
                break;
            }
            Err(e) => warn!(session_id, "Deputy dropped frame: {e}"),
        }
    }
    debug!(session_id, "PTY deputy finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            max_chunk: 4096,
            rows: 24,
            cols: 80,
            stop_grace: Duration::from_millis(300),
        }
    }

    async fn collect_until(output: &mut PtyOutput, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, output.next())
                .await
                .expect("timed out waiting for PTY output")
                .expect("PTY output ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    /// Gone or a zombie nobody has reaped yet.
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    fn background_pid(seen: &str) -> Option<u32> {
        seen.match_indices("bg-pid=").find_map(|(i, tag)| {
            let rest = &seen[i + tag.len()..];
            let end = rest.find('\r')?;
            rest[..end].parse().ok()
        })
    }

    #[tokio::test]
    async fn echoes_writes_in_order() {
        let (session, mut output) = PtySession::spawn("order", &opts()).unwrap();
        session.write(b"echo first-$((1+1))\n").unwrap();
        session.write(b"echo second-$((2+2))\n").unwrap();

        let seen = collect_until(&mut output, "second-4").await;
        let first = seen.find("first-2").expect("first command output missing");
        let second = seen.find("second-4").unwrap();
        assert!(first < second);

        session.stop().await;
    }

    #[tokio::test]
    async fn resize_is_visible_to_the_shell() {
        let (session, mut output) = PtySession::spawn("resize", &opts()).unwrap();
        session.resize(40, 120).unwrap();
        session.write(b"stty size; echo done-$((3*3))\n").unwrap();
        let seen = collect_until(&mut output, "done-9").await;
        assert!(seen.contains("40 120"), "unexpected output: {seen:?}");
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_output_and_kills_child() {
        let (session, mut output) = PtySession::spawn("stop", &opts()).unwrap();
        let pid = session.pid().unwrap();

        session.resize(40, 120).unwrap();
        session.write(&[b'x'; 100]).unwrap();

        tokio::time::timeout(Duration::from_secs(10), session.stop())
            .await
            .expect("stop did not complete");

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while output.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output did not terminate after stop");
        assert!(!session.is_running());
        assert!(process_gone(pid));
        assert!(output.next().await.is_none());
    }

    #[tokio::test]
    async fn stop_releases_pty_held_by_background_job() {
        let (session, mut output) = PtySession::spawn("bg", &opts()).unwrap();
        assert_eq!(session.io_threads(), 2);
        session.write(b"sleep 20 & echo bg-pid=$!\n").unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let bg_pid = loop {
            if let Some(pid) = background_pid(&seen) {
                break pid;
            }
            let chunk = tokio::time::timeout_at(deadline, output.next())
                .await
                .expect("timed out waiting for background pid")
                .expect("PTY output ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        };
        assert!(!process_gone(bg_pid));

        tokio::time::timeout(Duration::from_secs(10), session.stop())
            .await
            .expect("stop did not complete");
        while output.next().await.is_some() {}

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while session.io_threads() > 0 || !process_gone(bg_pid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "PTY master still held after stop (io threads: {})",
                session.io_threads()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn child_exit_ends_output_without_stop() {
        let (session, mut output) = PtySession::spawn("exit", &opts()).unwrap();
        session.write(b"exit 3\n").unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while output.next().await.is_some() {}
        })
        .await
        .expect("output did not end after shell exit");

        let mut exit_rx = session.exit_rx.clone();
        let _ = exit_rx.wait_for(Option::is_some).await;
        assert_eq!(session.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut bad = opts();
        bad.shell = "/nonexistent/shell".to_string();
        let err = PtySession::spawn("bad", &bad).err().unwrap();
        assert!(matches!(err, PtyError::Spawn { .. }));
    }
}
