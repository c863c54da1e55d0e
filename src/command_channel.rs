//! Request/response link to one device connection.
//!
//! The wire protocol carries no message ids, so a response can only be matched
//! to the command that is currently on the wire. The channel therefore keeps
//! exactly one command in flight and answers strictly in submission order. A
//! command that timed out after being written leaves a retired slot at the
//! head of the queue: the next command is held back until the late answer has
//! been swallowed or the grace period ran out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};

pub const DEFAULT_LATE_RESPONSE_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 4096;

/// How the response to a command is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Everything up to `\n`; the terminator and a preceding `\r` are stripped.
    Line,
    /// Exactly this many raw bytes.
    Bytes(usize),
    /// Fire and forget, resolved once written.
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Writing,
    AwaitingResponse,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Channel closed")]
    Closed,
}

type Reply = oneshot::Sender<Result<Vec<u8>, CommandError>>;

struct PendingCommand {
    command: Vec<u8>,
    expect: Expect,
    created_at: Instant,
    timeout: Duration,
    reply: Reply,
}

impl PendingCommand {
    fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    /// Listeners wait for unsolicited data and never put anything on the wire.
    fn is_listener(&self) -> bool {
        self.command.is_empty()
    }
}

enum Slot {
    Queued(PendingCommand),
    InFlight(PendingCommand),
    Retired { expect: Expect, until: Instant },
}

enum ChannelMsg {
    Submit(PendingCommand),
    ClearInput(oneshot::Sender<()>),
    Close,
}

/// Cloneable handle; the connection itself is owned by a background task.
#[derive(Clone)]
pub struct CommandChannel {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<ChannelMsg>,
    state: watch::Receiver<ChannelState>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandChannel {
    /// Take ownership of `transport` and start serving commands on it. Must be
    /// called from within a tokio runtime.
    pub fn start<T>(name: &str, transport: T, late_response_grace: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (tx, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Idle);
        let name: Arc<str> = Arc::from(name);

        let worker = ChannelWorker {
            name: name.clone(),
            reader,
            writer,
            inbox,
            queue: VecDeque::new(),
            rx_buf: Vec::new(),
            grace: late_response_grace,
            state: state_tx,
        };
        tokio::spawn(worker.run());

        Self { name, tx, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed || self.tx.is_closed()
    }

    /// Queue `command` and wait for its response.
    pub async fn send(
        &self,
        command: impl Into<Vec<u8>>,
        expect: Expect,
        timeout: Duration,
    ) -> Result<Vec<u8>, CommandError> {
        let (reply, answer) = oneshot::channel();
        let pending = PendingCommand {
            command: command.into(),
            expect,
            created_at: Instant::now(),
            timeout,
            reply,
        };
        self.tx
            .send(ChannelMsg::Submit(pending))
            .map_err(|_| CommandError::Closed)?;
        answer.await.map_err(|_| CommandError::Closed)?
    }

    /// Send a command and return its one-line answer, trimmed.
    pub async fn query_line(&self, command: impl Into<Vec<u8>>, timeout: Duration) -> Result<String, CommandError> {
        let line = self.send(command, Expect::Line, timeout).await?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    /// Wait for data the device sends on its own. Bytes that arrive after the
    /// timeout stay buffered for the next listener.
    pub async fn receive(&self, expect: Expect, timeout: Duration) -> Result<Vec<u8>, CommandError> {
        self.send(Vec::new(), expect, timeout).await
    }

    /// Drop everything received so far that no command has claimed.
    pub async fn clear_input(&self) -> Result<(), CommandError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ChannelMsg::ClearInput(ack))
            .map_err(|_| CommandError::Closed)?;
        done.await.map_err(|_| CommandError::Closed)
    }

    /// Reject everything pending and release the transport.
    pub fn close(&self) {
        let _ = self.tx.send(ChannelMsg::Close);
    }
}

struct ChannelWorker<T> {
    name: Arc<str>,
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    inbox: mpsc::UnboundedReceiver<ChannelMsg>,
    queue: VecDeque<Slot>,
    rx_buf: Vec<u8>,
    grace: Duration,
    state: watch::Sender<ChannelState>,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> ChannelWorker<T> {
    async fn run(mut self) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let reason = loop {
            self.advance().await;
            let deadline = self.next_deadline();

            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(ChannelMsg::Submit(pending)) => self.queue.push_back(Slot::Queued(pending)),
                    Some(ChannelMsg::ClearInput(ack)) => {
                        self.rx_buf.clear();
                        let _ = ack.send(());
                    }
                    Some(ChannelMsg::Close) | None => break CommandError::Closed,
                },
                read = self.reader.read(&mut chunk) => match read {
                    Ok(0) => break CommandError::Transport("connection closed by peer".to_string()),
                    Ok(n) => {
                        log::trace!("{}: received {} bytes", self.name, n);
                        self.rx_buf.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) => break CommandError::Transport(e.to_string()),
                },
                () = wait_for(deadline) => {}
            }
        };
        self.shutdown(reason).await;
    }

    /// Expire, dispatch and write until nothing else can happen without new
    /// input.
    async fn advance(&mut self) {
        loop {
            self.expire(Instant::now());
            if self.dispatch() {
                continue;
            }
            if matches!(self.queue.front(), Some(Slot::Queued(_))) {
                self.write_head().await;
                continue;
            }
            break;
        }
        let state = match self.queue.front() {
            Some(Slot::InFlight(_) | Slot::Retired { .. }) => ChannelState::AwaitingResponse,
            _ => ChannelState::Idle,
        };
        self.state.send_replace(state);
    }

    async fn write_head(&mut self) {
        let Some(Slot::Queued(pending)) = self.queue.pop_front() else {
            return;
        };
        if pending.reply.is_closed() {
            return;
        }
        if pending.is_listener() {
            self.queue.push_front(Slot::InFlight(pending));
            return;
        }

        self.state.send_replace(ChannelState::Writing);
        log::debug!("{}: writing {} byte command", self.name, pending.command.len());
        let written = timeout_at(pending.deadline(), async {
            self.writer.write_all(&pending.command).await?;
            self.writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) if pending.expect == Expect::Nothing => {
                let _ = pending.reply.send(Ok(Vec::new()));
            }
            Ok(Ok(())) => self.queue.push_front(Slot::InFlight(pending)),
            Ok(Err(e)) => {
                log::warn!("{}: write failed: {}", self.name, e);
                let _ = pending.reply.send(Err(CommandError::WriteFailed(e.to_string())));
            }
            Err(_) => {
                // Part of the command may be on the wire already.
                log::warn!("{}: write timed out", self.name);
                self.queue.push_front(Slot::Retired {
                    expect: pending.expect,
                    until: Instant::now() + self.grace,
                });
                let _ = pending.reply.send(Err(CommandError::Timeout(pending.timeout)));
            }
        }
    }

    fn dispatch(&mut self) -> bool {
        let expect = match self.queue.front() {
            Some(Slot::InFlight(pending)) => pending.expect,
            Some(Slot::Retired { expect, .. }) => *expect,
            _ => return false,
        };
        let Some(response) = take_response(&mut self.rx_buf, expect) else {
            return false;
        };

        match self.queue.pop_front() {
            Some(Slot::InFlight(pending)) => {
                let _ = pending.reply.send(Ok(response));
            }
            Some(Slot::Retired { .. }) => {
                log::warn!(
                    "{}: discarding late response ({} bytes) of a timed out command",
                    self.name,
                    response.len()
                );
            }
            _ => {}
        }
        true
    }

    fn expire(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.queue.len() {
            let expired = match &self.queue[index] {
                Slot::Queued(pending) => pending.deadline() <= now || pending.reply.is_closed(),
                Slot::InFlight(pending) => {
                    pending.deadline() <= now || (pending.is_listener() && pending.reply.is_closed())
                }
                Slot::Retired { until, .. } => *until <= now,
            };
            if !expired {
                index += 1;
                continue;
            }

            match self.queue.remove(index) {
                Some(Slot::Queued(pending)) => {
                    let _ = pending.reply.send(Err(CommandError::Timeout(pending.timeout)));
                }
                Some(Slot::InFlight(pending)) => {
                    let timeout = pending.timeout;
                    if !pending.is_listener() {
                        log::warn!("{}: command timed out after {:?}, retiring its slot", self.name, timeout);
                        self.queue.insert(
                            index,
                            Slot::Retired {
                                expect: pending.expect,
                                until: now + self.grace,
                            },
                        );
                        index += 1;
                    }
                    let _ = pending.reply.send(Err(CommandError::Timeout(timeout)));
                }
                Some(Slot::Retired { .. }) => {
                    log::debug!("{}: no late response arrived, dropping {} stale bytes", self.name, self.rx_buf.len());
                    self.rx_buf.clear();
                }
                None => {}
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .map(|slot| match slot {
                Slot::Queued(pending) | Slot::InFlight(pending) => pending.deadline(),
                Slot::Retired { until, .. } => *until,
            })
            .min()
    }

    async fn shutdown(mut self, reason: CommandError) {
        log::debug!("{}: closing channel ({})", self.name, reason);
        self.state.send_replace(ChannelState::Closed);
        for slot in self.queue.drain(..) {
            if let Slot::Queued(pending) | Slot::InFlight(pending) = slot {
                let _ = pending.reply.send(Err(reason.clone()));
            }
        }
        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                ChannelMsg::Submit(pending) => {
                    let _ = pending.reply.send(Err(reason.clone()));
                }
                ChannelMsg::ClearInput(ack) => {
                    let _ = ack.send(());
                }
                ChannelMsg::Close => {}
            }
        }
        let _ = self.writer.shutdown().await;
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn take_response(buf: &mut Vec<u8>, expect: Expect) -> Option<Vec<u8>> {
    match expect {
        Expect::Line => {
            let end = buf.iter().position(|&b| b == b'\n')?;
            let mut line: Vec<u8> = buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Some(line)
        }
        Expect::Bytes(count) if buf.len() >= count => Some(buf.drain(..count).collect()),
        Expect::Bytes(_) => None,
        Expect::Nothing => Some(Vec::new()),
    }
}
