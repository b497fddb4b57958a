use bytes::BytesMut;
use futures::SinkExt;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::codec::{CommandCodec, DecodeError, ReplyDecoder};
use crate::command::{self, Command, CommandName};
use crate::config::Config;
use crate::frame::Frame;

#[derive(Debug, ThisError, Clone)]
pub enum Error {
    #[error("connection has been closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    /// The server answered with an error reply. Only the command that received it is affected.
    #[error("{0}")]
    Reply(String),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("protocol desync; received a reply with no pending command")]
    Desync,
    #[error(transparent)]
    Command(#[from] command::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The socket is being opened, commands are queued.
    Connecting,
    /// Commands are written as soon as they are issued.
    Open,
    /// Terminal. Every outstanding command has been failed.
    Closed,
}

/// Lifecycle notifications, see [`Connection::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened,
    /// The peer finished writing.
    End,
    Error(String),
    Closed,
}

/// Handle to one connection.
///
/// The socket, the decoder and both pending queues are owned by a single task. Handles only talk
/// to it through a channel, so every state change happens on that task, one message or read at a
/// time. Cloning the handle is cheap and all clones share the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<Event>,
}

impl Connection {
    /// Starts connecting to `config.host:config.port` and returns right away in the
    /// [`ConnectionState::Connecting`] state. Must be called within a tokio runtime.
    pub fn connect(config: Config) -> Connection {
        let addr = config.addr();
        let nodelay = config.nodelay;

        Connection::from_connector(&config, async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(nodelay)?;
            if let Ok(peer) = stream.peer_addr() {
                tracing::Span::current().record("peer", peer.to_string());
            }
            Ok::<_, io::Error>(stream)
        })
    }

    /// Like [`Connection::connect`] but over any byte stream produced by `connect`.
    pub fn from_connector<F, S>(config: &Config, connect: F) -> Connection
    where
        F: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = Uuid::new_v4();
        let (tx, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(64);

        let actor = Actor {
            id,
            inbox,
            accepting: true,
            state: state_tx,
            events: events.clone(),
            decoder: ReplyDecoder::from_config(config),
            pending_commands: VecDeque::new(),
            pending_replies: VecDeque::new(),
        };

        tokio::spawn(run(actor, connect));

        Connection {
            id,
            tx,
            state,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receives lifecycle events from now on. Events sent before subscribing are not replayed,
    /// use [`Connection::state`] or [`Connection::opened`] to observe the current state.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Waits until the connection leaves [`ConnectionState::Connecting`].
    pub async fn opened(&self) -> Result<(), Error> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s);

        match reached {
            Ok(ConnectionState::Open) => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Waits until the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the connection task is gone, which only happens once it closed.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Hands `command` to the connection and returns a future for its reply.
    ///
    /// Fails right away once the connection is closed. A command that is accepted is always
    /// resolved exactly once, with its reply or with the reason the connection closed.
    pub fn send(&self, command: Command) -> Result<ReplyFuture, Error> {
        command.validate()?;

        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Issue { command, reply })
            .map_err(|_| Error::ConnectionClosed)?;

        Ok(ReplyFuture { rx })
    }

    /// Sends `command` and waits for its reply. Error replies come back as [`Error::Reply`].
    pub async fn issue(&self, command: Command) -> Result<Frame, Error> {
        self.send(command)?.await
    }

    pub async fn call<I, A>(&self, name: CommandName, args: I) -> Result<Frame, Error>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.issue(Command::from_name(name, args)).await
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Frame, Error> {
        self.call(CommandName::Get, [key.as_ref()]).await
    }

    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<Frame, Error> {
        self.call(CommandName::Set, [key.as_ref(), value.as_ref()])
            .await
    }

    pub async fn del(&self, key: impl AsRef<[u8]>) -> Result<Frame, Error> {
        self.call(CommandName::Del, [key.as_ref()]).await
    }

    pub async fn keys(&self, pattern: impl AsRef<[u8]>) -> Result<Frame, Error> {
        self.call(CommandName::Keys, [pattern.as_ref()]).await
    }

    pub async fn ping(&self) -> Result<Frame, Error> {
        self.call(CommandName::Ping, std::iter::empty::<&[u8]>())
            .await
    }

    /// Asks the connection to shut the socket down. Outstanding commands are failed with
    /// [`Error::ConnectionClosed`] by the connection task, not by this call.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }
}

/// Resolves to the reply of one command.
#[derive(Debug)]
pub struct ReplyFuture {
    rx: oneshot::Receiver<Result<Frame, Error>>,
}

impl Future for ReplyFuture {
    type Output = Result<Frame, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

#[derive(Debug)]
enum Message {
    Issue {
        command: Command,
        reply: oneshot::Sender<Result<Frame, Error>>,
    },
    Close,
}

// A command issued before the socket was open.
struct PendingCommand {
    command: Command,
    reply: oneshot::Sender<Result<Frame, Error>>,
}

// A command written to the socket, waiting for its reply.
struct PendingReply {
    reply: oneshot::Sender<Result<Frame, Error>>,
}

impl PendingReply {
    fn resolve(self, result: Result<Frame, Error>) {
        // The caller may have dropped the future, nothing to do then.
        let _ = self.reply.send(result);
    }
}

type Writer<S> = FramedWrite<WriteHalf<S>, CommandCodec>;

async fn close_writer<S: AsyncWrite>(writer: &mut Writer<S>) -> io::Result<()> {
    SinkExt::<Command>::close(writer).await
}

struct Actor {
    id: Uuid,
    inbox: mpsc::UnboundedReceiver<Message>,
    // False once every handle is gone. The connection then only lives until the replies already
    // asked for have arrived.
    accepting: bool,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<Event>,
    decoder: ReplyDecoder,
    pending_commands: VecDeque<PendingCommand>,
    pending_replies: VecDeque<PendingReply>,
}

#[instrument(
    name = "connection",
    skip_all,
    fields(connection_id = %actor.id, peer = tracing::field::Empty)
)]
async fn run<F, S>(mut actor: Actor, connect: F)
where
    F: Future<Output = io::Result<S>> + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let reason = match actor.wait_for_socket(connect).await {
        Ok(stream) => actor.serve(stream).await,
        Err(reason) => reason,
    };

    actor.shutdown(reason).await;
}

impl Actor {
    /// Queues commands until the socket is connected.
    async fn wait_for_socket<F, S>(&mut self, connect: F) -> Result<S, Error>
    where
        F: Future<Output = io::Result<S>>,
    {
        debug!("connecting");
        tokio::pin!(connect);

        loop {
            tokio::select! {
                res = &mut connect => {
                    return res.map_err(|err| {
                        error!(error = %err, "failed to connect");
                        Error::from(err)
                    });
                }
                msg = self.inbox.recv(), if self.accepting => match msg {
                    Some(Message::Issue { command, reply }) => {
                        debug!(%command, "queueing command until the connection is open");
                        self.pending_commands.push_back(PendingCommand { command, reply });
                    }
                    Some(Message::Close) => return Err(Error::ConnectionClosed),
                    None => {
                        self.accepting = false;
                        if self.pending_commands.is_empty() {
                            return Err(Error::ConnectionClosed);
                        }
                    }
                },
            }
        }
    }

    async fn serve<S>(&mut self, stream: S) -> Error
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer = FramedWrite::new(writer, CommandCodec);

        self.state.send_replace(ConnectionState::Open);
        self.emit(Event::Opened);
        info!(queued = self.pending_commands.len(), "connection open");

        while let Some(PendingCommand { command, reply }) = self.pending_commands.pop_front() {
            if let Err(err) = self.write(&mut writer, command, reply).await {
                return err;
            }
        }

        let mut chunk = BytesMut::with_capacity(4096);

        loop {
            if !self.accepting && self.pending_replies.is_empty() {
                debug!("all handles dropped and no reply outstanding");
                let _ = close_writer(&mut writer).await;
                return Error::ConnectionClosed;
            }

            tokio::select! {
                msg = self.inbox.recv(), if self.accepting => match msg {
                    Some(Message::Issue { command, reply }) => {
                        if let Err(err) = self.write(&mut writer, command, reply).await {
                            return err;
                        }
                    }
                    Some(Message::Close) => {
                        debug!("closing connection");
                        if let Err(err) = close_writer(&mut writer).await {
                            debug!(error = %err, "failed to shut down socket");
                        }
                        return Error::ConnectionClosed;
                    }
                    None => self.accepting = false,
                },
                res = reader.read_buf(&mut chunk) => match res {
                    Ok(0) => {
                        debug!("peer closed the connection");
                        self.emit(Event::End);
                        return Error::ConnectionClosed;
                    }
                    Ok(n) => {
                        trace!(bytes = n, "received data");
                        self.decoder.feed(&chunk);
                        chunk.clear();
                        if let Err(err) = self.dispatch() {
                            return err;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "failed to read from socket");
                        return err.into();
                    }
                },
            }
        }
    }

    async fn write<S>(
        &mut self,
        writer: &mut Writer<S>,
        command: Command,
        reply: oneshot::Sender<Result<Frame, Error>>,
    ) -> Result<(), Error>
    where
        S: AsyncWrite,
    {
        debug!(%command, "sending command");

        // Queued before writing so a failed write still resolves it, through shutdown.
        self.pending_replies.push_back(PendingReply { reply });

        writer.send(command).await.map_err(|err| {
            error!(error = %err, "failed to write command");
            Error::from(err)
        })
    }

    /// Hands every complete reply in the decoder to the oldest pending command.
    fn dispatch(&mut self) -> Result<(), Error> {
        while let Some(frame) = self.decoder.try_extract().map_err(|err| {
            error!(error = %err, "failed to decode reply");
            Error::from(err)
        })? {
            let Some(pending) = self.pending_replies.pop_front() else {
                error!(reply = %frame, "received a reply with no pending command");
                return Err(Error::Desync);
            };

            debug!(reply = %frame, "received reply");

            let result = match frame {
                Frame::Error(msg) => Err(Error::Reply(msg)),
                frame => Ok(frame),
            };
            pending.resolve(result);
        }

        Ok(())
    }

    /// Moves to the terminal state and fails everything still outstanding with `reason`.
    async fn shutdown(&mut self, reason: Error) {
        if !matches!(reason, Error::ConnectionClosed) {
            self.emit(Event::Error(reason.to_string()));
        }

        self.state.send_replace(ConnectionState::Closed);
        self.inbox.close();

        if self.decoder.buffered() > 0 {
            debug!(
                bytes = self.decoder.buffered(),
                "discarding incomplete reply"
            );
            self.decoder.clear();
        }

        let outstanding = self.pending_replies.len() + self.pending_commands.len();
        if outstanding > 0 {
            warn!(outstanding, reason = %reason, "failing outstanding commands");
        }

        for pending in self.pending_replies.drain(..) {
            pending.resolve(Err(reason.clone()));
        }
        for pending in self.pending_commands.drain(..) {
            let _ = pending.reply.send(Err(reason.clone()));
        }
        // Commands accepted by a handle that the task never got to.
        while let Some(msg) = self.inbox.recv().await {
            if let Message::Issue { reply, .. } = msg {
                let _ = reply.send(Err(reason.clone()));
            }
        }

        info!(reason = %reason, "connection closed");
        self.emit(Event::Closed);
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
