//! Scheduler-side handle to one worker process.
//!
//! Owns the child, writes commands to its stdin and receives replies from a
//! reader thread over a channel so every wait has a deadline. One request
//! is outstanding at a time; a timeout or a dead pipe means the worker can
//! no longer be trusted and the caller must tear it down.

use std::io::{self, BufReader, BufWriter};
use std::process::{Child, ChildStdin};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use genserve_types::{GenError, Result};
use log::{debug, warn};

use super::framing::{read_frame, write_frame};
use super::ipc_types::WorkerMessage;

const EXIT_POLL: Duration = Duration::from_millis(20);

pub struct WorkerBridge {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    replies: Receiver<WorkerMessage>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerBridge {
    /// Take over a freshly spawned child with piped stdin and stdout.
    pub fn attach(mut child: Child) -> Result<Self> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GenError::Load("worker stdio was not captured".into()));
        };

        let pid = child.id();
        let (tx, replies) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name(format!("worker-{pid}-reader"))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    match read_frame(&mut stdout) {
                        Ok(Some(message)) => {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("[PROCESS_MGR] worker {pid} closed its stdout");
                            break;
                        }
                        Err(e) => {
                            warn!("[PROCESS_MGR] unreadable frame from worker {pid}: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| GenError::Load(format!("failed to start worker reader: {e}")))?;

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            replies,
            reader: Some(reader),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Write one command without waiting for a reply.
    pub fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        let pid = self.pid();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| GenError::ProcessCrash(format!("worker {pid} stdin already closed")))?;
        write_frame(stdin, message).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => {
                GenError::ProcessCrash(format!("worker {pid} is gone (broken pipe)"))
            }
            _ => GenError::ProcessCrash(format!("failed to write to worker {pid}: {e}")),
        })
    }

    /// Send a command and wait up to `timeout` for its single reply.
    pub fn request(&mut self, message: &WorkerMessage, timeout: Duration) -> Result<WorkerMessage> {
        self.send(message)?;
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(GenError::Timeout(format!(
                "worker {} did not answer {:?} within {}s",
                self.pid(),
                message.kind,
                timeout.as_secs_f64()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                let status = self.exit_status_hint();
                Err(GenError::ProcessCrash(format!(
                    "worker {} exited while handling {:?}{status}",
                    self.pid(),
                    message.kind
                )))
            }
        }
    }

    /// Close stdin so a worker blocked on reading sees end of input.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("[PROCESS_MGR] worker {} exited with {status}", self.child.id());
                    return true;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => return false,
                Err(e) => {
                    warn!("[PROCESS_MGR] cannot poll worker {}: {e}", self.child.id());
                    return false;
                }
            }
        }
    }

    /// Ask the process to stop (SIGTERM where available).
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            // pid fits: it came from a live Child we still own
            let pid = self.child.id() as libc::pid_t;
            // SAFETY: plain signal delivery to our own child.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    /// Kill the process and reap it. The OS reclaims all of its memory.
    pub fn kill(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            warn!("[PROCESS_MGR] killing worker {}", self.child.id());
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        self.stdin = None;
        // detached: it ends when the last holder of the stdout pipe exits
        self.reader.take();
    }

    fn exit_status_hint(&mut self) -> String {
        // the pipe may close a moment before the exit is observable
        self.wait_for_exit(Duration::from_millis(200));
        match self.child.try_wait() {
            Ok(Some(status)) => format!(" ({status})"),
            _ => String::new(),
        }
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc_types::MessageKind;
    use std::process::{Command, Stdio};

    fn spawn(script: &str) -> WorkerBridge {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .unwrap();
        WorkerBridge::attach(child).unwrap()
    }

    #[test]
    fn silent_worker_times_out() {
        let mut bridge = spawn("exec sleep 30");
        let err = bridge
            .request(&WorkerMessage::unload(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, GenError::Timeout(_)));
        assert!(err.is_worker_fatal());
        bridge.kill();
        assert!(!bridge.is_alive());
    }

    #[test]
    fn exited_worker_is_a_crash() {
        let mut bridge = spawn("exit 3");
        let err = bridge
            .request(&WorkerMessage::unload(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, GenError::ProcessCrash(_)), "{err:?}");
    }

    #[test]
    fn replies_arrive_through_the_reader_thread() {
        // echo the unload frame back verbatim: it is a valid message
        let mut bridge = spawn("exec head -c 21");
        let reply = bridge
            .request(&WorkerMessage::unload(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Unload);
        assert!(bridge.wait_for_exit(Duration::from_secs(5)));
    }
}
