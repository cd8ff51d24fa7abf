//! Many concurrent calls over one connection.
//!
//! Both sides run one reader loop and one writer task per connection. All
//! outgoing frames go through the writer's queue, so frames of different
//! calls never interleave on the wire. Incoming frames are routed by stream
//! id into per-call queues.
//!
//! Each direction of a call starts with [`CALL_QUEUE`] messages of credit.
//! A sender waits for credit before every message, and the receiving side
//! hands credit back in `WINDOW` frames as its consumer drains the queue.
//! Readers therefore never wait on one call. A peer that sends past its
//! credit has only that call failed, with `ResourceExhausted`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::cancel::Context;
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::metadata::AUTHORITY;
use crate::wire::{CallHeaders, Frame, FrameKind, Metadata, ProtocolError, Status, MAX_MESSAGE_SIZE};

/// Capacity of the per-connection writer queue.
const OUTBOUND_QUEUE: usize = 64;

/// Messages a sender may have unacknowledged on one call.
pub const CALL_QUEUE: usize = 16;

/// Consumed messages handed back per `WINDOW` frame.
const WINDOW_BATCH: u32 = (CALL_QUEUE / 2) as u32;

/// Byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

fn spawn_writer<W>(mut writer: W, mut queue: mpsc::Receiver<Frame>, closed: Context)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            let frame = tokio::select! {
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = closed.cancelled() => break,
            };

            match write_frame(&mut writer, &frame, &mut buf).await {
                Ok(()) => {}
                Err(ProtocolError::Io(e)) => {
                    debug!("connection write failed: {}", e);
                    break;
                }
                // Encoding failed before anything was written.
                Err(e) => warn!(
                    "dropped {:?} frame on stream {}: {}",
                    frame.kind, frame.stream_id, e
                ),
            }
            if queue.is_empty() && writer.flush().await.is_err() {
                break;
            }
        }
        closed.cancel();
        let _ = writer.shutdown().await;
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_size(message: &Bytes) -> Result<(), Status> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(Status::resource_exhausted(format!(
            "message of {} bytes is larger than the {} byte limit",
            message.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

/// Message credit the remote end granted for one direction of a call.
#[derive(Clone)]
struct Credit(Arc<Semaphore>);

impl Credit {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(CALL_QUEUE)))
    }

    /// Waits for room for one more message. False once the call is over.
    async fn take(&self) -> bool {
        match self.0.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn grant(&self, increment: u32) {
        let room = CALL_QUEUE.saturating_sub(self.0.available_permits());
        self.0.add_permits((increment as usize).min(room));
    }

    fn close(&self) {
        self.0.close();
    }
}

/// Counts consumed messages and hands them back as `WINDOW` frames.
struct Drained {
    id: u32,
    outbound: mpsc::Sender<Frame>,
    pending: u32,
}

impl Drained {
    fn new(id: u32, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            outbound,
            pending: 0,
        }
    }

    async fn consumed(&mut self) {
        self.pending += 1;
        if self.pending >= WINDOW_BATCH {
            let _ = self.outbound.send(Frame::window(self.id, self.pending)).await;
            self.pending = 0;
        }
    }
}

enum Inbound {
    Message(Bytes),
    Trailers(Status),
}

struct ClientStream {
    inbound: mpsc::Sender<Inbound>,
    /// Credit for this side's messages.
    credit: Credit,
}

struct ClientShared {
    label: String,
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, ClientStream>>,
    next_id: AtomicU32,
    active: AtomicUsize,
    last_active: Mutex<Instant>,
    closed: Context,
}

impl ClientShared {
    fn closed_status(&self) -> Status {
        Status::unavailable(format!("connection to {} closed", self.label))
    }

    fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    fn finish_stream(&self, id: u32) {
        if let Some(stream) = lock(&self.streams).remove(&id) {
            stream.credit.close();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Client side of a multiplexed connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Starts the client side of the protocol over `io`. `label` names the
    /// remote end in errors and logs.
    pub fn new<T: Io>(io: T, label: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let closed = Context::new();

        let shared = Arc::new(ClientShared {
            label: label.into(),
            outbound,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            active: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            closed: closed.clone(),
        });

        spawn_writer(writer, queue, closed.clone());
        tokio::spawn(client_reader(reader, Arc::downgrade(&shared), closed));

        Self { shared }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// True when no call is in flight and none finished within `idle`.
    pub fn is_idle_for(&self, idle: Duration) -> bool {
        self.shared.active.load(Ordering::SeqCst) == 0
            && lock(&self.shared.last_active).elapsed() >= idle
    }

    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Opens a call. The returned sender and receiver can be driven from
    /// different tasks.
    pub async fn open_call(&self, headers: &CallHeaders) -> Result<(CallSender, CallReceiver), Status> {
        if self.is_closed() {
            return Err(self.shared.closed_status());
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::SeqCst);
        let frame = Frame::headers(id, headers).map_err(|e| Status::invalid_argument(e.to_string()))?;

        // One slot past the window so trailers always fit.
        let (tx, inbound) = mpsc::channel(CALL_QUEUE + 1);
        let credit = Credit::new();
        lock(&self.shared.streams).insert(
            id,
            ClientStream {
                inbound: tx,
                credit: credit.clone(),
            },
        );
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.shared.touch();

        let receiver = CallReceiver {
            id,
            shared: Arc::clone(&self.shared),
            inbound,
            drained: Drained::new(id, self.shared.outbound.clone()),
            done: false,
        };

        if self.shared.outbound.send(frame).await.is_err() {
            return Err(self.shared.closed_status());
        }

        let sender = CallSender {
            id,
            outbound: self.shared.outbound.clone(),
            credit,
            label: self.shared.label.clone(),
        };
        Ok((sender, receiver))
    }
}

async fn client_reader<R>(mut reader: R, shared: Weak<ClientShared>, closed: Context)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, &mut buf) => frame,
            _ = closed.cancelled() => break,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("connection read failed: {}", e);
                break;
            }
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let id = frame.stream_id;

        match frame.kind {
            FrameKind::Message => {
                let mut streams = lock(&shared.streams);
                let Some(stream) = streams.get(&id) else {
                    continue;
                };
                if stream.inbound.capacity() > 1 {
                    if stream.inbound.try_send(Inbound::Message(frame.body)).is_err() {
                        if let Some(stream) = streams.remove(&id) {
                            stream.credit.close();
                        }
                    }
                    continue;
                }

                warn!("{} sent past its window on stream {}", shared.label, id);
                if let Some(stream) = streams.remove(&id) {
                    stream.credit.close();
                    let status = Status::resource_exhausted(format!(
                        "{} sent more than {} unacknowledged messages",
                        shared.label, CALL_QUEUE
                    ));
                    let _ = stream.inbound.try_send(Inbound::Trailers(status));
                }
                drop(streams);
                let _ = shared.outbound.try_send(Frame::cancel(id));
            }
            FrameKind::Trailers => {
                let status = frame
                    .parse_trailers()
                    .unwrap_or_else(|e| Status::internal(e.to_string()));
                let stream = lock(&shared.streams).remove(&id);
                if let Some(stream) = stream {
                    stream.credit.close();
                    let _ = stream.inbound.try_send(Inbound::Trailers(status));
                }
            }
            FrameKind::Window => match frame.window_increment() {
                Ok(increment) => {
                    if let Some(stream) = lock(&shared.streams).get(&id) {
                        stream.credit.grant(increment);
                    }
                }
                Err(e) => debug!("bad window from {}: {}", shared.label, e),
            },
            kind => {
                warn!(
                    "unexpected {:?} frame from {} on stream {}",
                    kind, shared.label, id
                );
            }
        }
    }

    closed.cancel();
    if let Some(shared) = shared.upgrade() {
        // Dropping the senders tells every pending receiver the connection is gone.
        for (_, stream) in lock(&shared.streams).drain() {
            stream.credit.close();
        }
    }
}

/// Sending half of a client call.
#[derive(Clone)]
pub struct CallSender {
    id: u32,
    outbound: mpsc::Sender<Frame>,
    credit: Credit,
    label: String,
}

impl CallSender {
    /// Waits for credit, then queues `message`.
    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        check_size(&message)?;
        if !self.credit.take().await {
            return Err(Status::unavailable(format!(
                "call to {} is no longer open",
                self.label
            )));
        }
        self.push(Frame::message(self.id, message)).await
    }

    /// Tells the remote end no more messages follow.
    pub async fn close_send(&self) -> Result<(), Status> {
        self.push(Frame::half_close(self.id)).await
    }

    async fn push(&self, frame: Frame) -> Result<(), Status> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Status::unavailable(format!("connection to {} closed", self.label)))
    }
}

/// Receiving half of a client call. Dropping it before the call completed
/// cancels the call on the remote end.
pub struct CallReceiver {
    id: u32,
    shared: Arc<ClientShared>,
    inbound: mpsc::Receiver<Inbound>,
    drained: Drained,
    done: bool,
}

impl CallReceiver {
    /// Next message; `Ok(None)` once the call ended with an OK status.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        if self.done {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Message(message)) => {
                self.drained.consumed().await;
                Ok(Some(message))
            }
            Some(Inbound::Trailers(status)) => {
                self.complete();
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status)
                }
            }
            None => {
                self.complete();
                Err(self.shared.closed_status())
            }
        }
    }

    /// Abandons the call, telling the remote end to stop.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.complete();

        let frame = Frame::cancel(self.id);
        if let Err(mpsc::error::TrySendError::Full(frame)) = self.shared.outbound.try_send(frame) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let outbound = self.shared.outbound.clone();
                handle.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
        }
    }

    fn complete(&mut self) {
        self.done = true;
        self.shared.finish_stream(self.id);
    }
}

impl Drop for CallReceiver {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Serves calls accepted by [`serve_connection`].
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, call: ServerCall);
}

/// What the server knows about the connection a call arrived on.
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Address the caller dialled, used as `:authority` when the caller sent none.
    pub authority: Option<String>,
}

/// Messages from the caller of one server call.
pub struct CallInbound {
    rx: mpsc::Receiver<Bytes>,
    drained: Drained,
}

impl CallInbound {
    /// Next message; `None` once the caller half-closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let message = self.rx.recv().await?;
        self.drained.consumed().await;
        Some(message)
    }
}

/// Server side of one call.
pub struct ServerCall {
    pub headers: CallHeaders,
    pub conn: ConnInfo,
    pub ctx: Context,
    pub deadline: Option<Instant>,
    pub inbound: CallInbound,
    pub responder: Responder,
}

impl ServerCall {
    pub fn method(&self) -> &str {
        &self.headers.method
    }

    pub fn metadata(&self) -> &Metadata {
        &self.headers.metadata
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

/// Writes responses for one server call. Clones share the call.
#[derive(Clone)]
pub struct Responder {
    id: u32,
    outbound: mpsc::Sender<Frame>,
    credit: Credit,
    finished: Arc<AtomicBool>,
}

impl Responder {
    /// Waits for credit, then queues `message`.
    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Status::internal("call already finished"));
        }
        check_size(&message)?;
        if !self.credit.take().await {
            return Err(Status::cancelled("caller went away"));
        }
        self.outbound
            .send(Frame::message(self.id, message))
            .await
            .map_err(|_| Status::cancelled("caller went away"))
    }

    /// Ends the call. Only the first status is sent.
    pub async fn finish(&self, status: Status) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.credit.close();
        let _ = self.outbound.send(Frame::trailers(self.id, &status)).await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

struct ServerStream {
    inbound: Option<mpsc::Sender<Bytes>>,
    ctx: Context,
    responder: Responder,
}

impl ServerStream {
    fn abandon(self) {
        self.ctx.cancel();
        self.responder.credit.close();
    }
}

/// Runs the server side of the protocol over `io` until the peer hangs up or
/// `shutdown` is cancelled. Each call runs in its own task.
pub async fn serve_connection<T: Io>(
    io: T,
    handler: Arc<dyn CallHandler>,
    conn: ConnInfo,
    shutdown: &Context,
) {
    let (mut reader, writer) = tokio::io::split(io);
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let closed = shutdown.child();
    spawn_writer(writer, queue, closed.clone());

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u32>();
    let mut streams: HashMap<u32, ServerStream> = HashMap::new();
    let mut buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            Some(id) = done_rx.recv() => {
                streams.remove(&id);
                continue;
            }
            frame = read_frame(&mut reader, &mut buf) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(ProtocolError::Io(e)) => {
                debug!("connection from {:?} dropped: {}", conn.remote_addr, e);
                break;
            }
            Err(e) => {
                warn!("protocol error from {:?}: {}", conn.remote_addr, e);
                break;
            }
        };
        let id = frame.stream_id;

        match frame.kind {
            FrameKind::Headers => {
                if streams.contains_key(&id) {
                    warn!("duplicate stream id {} from {:?}", id, conn.remote_addr);
                    continue;
                }
                let mut headers = match frame.parse_headers() {
                    Ok(headers) => headers,
                    Err(e) => {
                        let status = Status::invalid_argument(e.to_string());
                        let _ = outbound.send(Frame::trailers(id, &status)).await;
                        continue;
                    }
                };
                if !headers.metadata.contains_key(AUTHORITY) {
                    if let Some(authority) = &conn.authority {
                        headers.metadata.set(AUTHORITY, [authority.clone()]);
                    }
                }

                let (tx, rx) = mpsc::channel(CALL_QUEUE);
                let ctx = closed.child();
                let responder = Responder {
                    id,
                    outbound: outbound.clone(),
                    credit: Credit::new(),
                    finished: Arc::new(AtomicBool::new(false)),
                };
                streams.insert(
                    id,
                    ServerStream {
                        inbound: Some(tx),
                        ctx: ctx.clone(),
                        responder: responder.clone(),
                    },
                );

                let call = ServerCall {
                    deadline: headers.timeout().map(|t| Instant::now() + t),
                    headers,
                    conn: conn.clone(),
                    ctx,
                    inbound: CallInbound {
                        rx,
                        drained: Drained::new(id, outbound.clone()),
                    },
                    responder,
                };
                tokio::spawn(run_call(Arc::clone(&handler), call, done_tx.clone()));
            }
            FrameKind::Message => {
                let Some(stream) = streams.get_mut(&id) else {
                    continue;
                };
                let Some(tx) = &stream.inbound else {
                    continue;
                };
                match tx.try_send(frame.body) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => stream.inbound = None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("caller {:?} sent past its window on stream {}", conn.remote_addr, id);
                        if let Some(stream) = streams.remove(&id) {
                            let responder = stream.responder.clone();
                            stream.abandon();
                            tokio::spawn(async move {
                                responder
                                    .finish(Status::resource_exhausted(format!(
                                        "more than {} unacknowledged messages",
                                        CALL_QUEUE
                                    )))
                                    .await;
                            });
                        }
                    }
                }
            }
            FrameKind::HalfClose => {
                if let Some(stream) = streams.get_mut(&id) {
                    stream.inbound = None;
                }
            }
            FrameKind::Cancel => {
                if let Some(stream) = streams.remove(&id) {
                    stream.abandon();
                }
            }
            FrameKind::Window => match frame.window_increment() {
                Ok(increment) => {
                    if let Some(stream) = streams.get(&id) {
                        stream.responder.credit.grant(increment);
                    }
                }
                Err(e) => debug!("bad window from {:?}: {}", conn.remote_addr, e),
            },
            FrameKind::Trailers => {
                warn!("unexpected trailers from caller {:?}", conn.remote_addr);
            }
        }
    }

    closed.cancel();
    for (_, stream) in streams.drain() {
        stream.abandon();
    }
}

async fn run_call(handler: Arc<dyn CallHandler>, call: ServerCall, done: mpsc::UnboundedSender<u32>) {
    let id = call.responder.id;
    let responder = call.responder.clone();
    let ctx = call.ctx.clone();
    let deadline = call.deadline;

    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = handler.handle(call) => responder.finish(Status::ok()).await,
        _ = ctx.cancelled() => {}
        _ = expired => {
            ctx.cancel();
            responder.finish(Status::deadline_exceeded("deadline exceeded")).await;
        }
    }

    let _ = done.send(id);
}
