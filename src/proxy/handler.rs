//! Transparent handler for every proxied method.
//!
//! Payloads are never decoded. A one-to-one call is relayed as is, status
//! included. A one-to-many call opens one upstream per backend, broadcasts the
//! caller's messages to all of them and merges their responses back, each
//! message tagged with the peer that produced it. A failing peer turns into an
//! error message of its own and the call carries on with the rest.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;

use super::backend::Backend;
use super::director::{Director, Mode};
use super::streaming::StreamingDetector;
use crate::cancel::Context;
use crate::transport::mux::{CallHandler, CallInbound, CallReceiver, CallSender, Responder, ServerCall, CALL_QUEUE};
use crate::wire::{CallHeaders, Metadata, Status, MAX_MESSAGE_SIZE};

/// Deadline applied to unary calls that arrive without one.
pub const DEFAULT_UNARY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxyHandler {
    director: Director,
    detector: StreamingDetector,
    unary_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(director: Director, detector: StreamingDetector) -> Self {
        Self {
            director,
            detector,
            unary_timeout: DEFAULT_UNARY_TIMEOUT,
        }
    }

    pub fn with_unary_timeout(mut self, timeout: Duration) -> Self {
        self.unary_timeout = timeout;
        self
    }

    /// The caller's deadline if it sent one; otherwise the unary default, and
    /// none at all for streamed methods.
    fn deadline(&self, requested: Option<Instant>, streaming: bool) -> Option<Instant> {
        requested.or_else(|| (!streaming).then(|| Instant::now() + self.unary_timeout))
    }
}

#[async_trait]
impl CallHandler for ProxyHandler {
    async fn handle(&self, call: ServerCall) {
        let ServerCall {
            headers,
            ctx,
            deadline,
            inbound,
            responder,
            ..
        } = call;

        let streaming = self.detector.is_streamed(&headers.method);
        let (mode, backends) = match self.director.direct(&headers.method, &headers.metadata).await {
            Ok(plan) => plan,
            Err(status) => {
                debug!("{} rejected: {}", headers.method, status);
                responder.finish(status).await;
                return;
            }
        };

        let relay = Relay {
            deadline: self.deadline(deadline, streaming),
            method: headers.method,
            metadata: headers.metadata,
            streaming,
            ctx: ctx.child(),
        };

        match mode {
            Mode::OneToOne => match backends.into_iter().next() {
                Some(backend) => relay.one_to_one(backend, inbound, responder).await,
                None => responder.finish(Status::internal("no backend for call")).await,
            },
            Mode::OneToMany => relay.one_to_many(backends, inbound, responder).await,
        }
    }
}

/// One proxied call.
struct Relay {
    method: String,
    metadata: Metadata,
    streaming: bool,
    deadline: Option<Instant>,
    /// Parent of every upstream's context; cancelled when the relay ends.
    ctx: Context,
}

impl Relay {
    async fn open(&self, backend: &Backend) -> Result<(CallSender, CallReceiver), Status> {
        let (metadata, conn) = backend.get_connection(&self.metadata).await?;
        let timeout = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        conn.open_call(&CallHeaders::new(self.method.as_str(), metadata).with_timeout(timeout))
            .await
    }

    async fn one_to_one(self, backend: Backend, inbound: CallInbound, responder: Responder) {
        let _guard = self.ctx.drop_guard();

        let (sender, mut receiver) = match self.open(&backend).await {
            Ok(call) => call,
            Err(status) => {
                debug!("{} -> {}: {}", self.method, backend, status);
                responder.finish(status).await;
                return;
            }
        };
        debug!("{} -> {}", self.method, backend);

        let mut pump = tokio::spawn(pump_caller(inbound, vec![sender], self.streaming, self.ctx.child()));
        let mut pumping = true;
        let expired = expire_at(self.deadline);
        tokio::pin!(expired);

        let status = loop {
            tokio::select! {
                joined = &mut pump, if pumping => {
                    pumping = false;
                    if let Some(status) = caller_violation(joined) {
                        receiver.cancel();
                        break status;
                    }
                }
                _ = &mut expired => {
                    receiver.cancel();
                    break Status::deadline_exceeded(format!("{} did not answer in time", backend));
                }
                message = receiver.recv() => match message {
                    Ok(Some(message)) => {
                        if let Err(status) = responder.send(message).await {
                            receiver.cancel();
                            break status;
                        }
                    }
                    Ok(None) => break Status::ok(),
                    Err(status) => break status,
                },
            }
        };
        responder.finish(status).await;
    }

    async fn one_to_many(self, backends: Vec<Backend>, inbound: CallInbound, responder: Responder) {
        let _guard = self.ctx.drop_guard();
        let mut envelope = CallEnvelope::new(&self.method, Mode::OneToMany, backends.iter().map(Backend::target));

        let opened = join_all(backends.iter().map(|backend| self.open(backend))).await;

        let mut senders = Vec::with_capacity(backends.len());
        let mut upstreams: Vec<BoxStream<'static, (usize, Upstream)>> = Vec::with_capacity(backends.len());
        for (index, (backend, result)) in backends.iter().zip(opened).enumerate() {
            match result {
                Ok((sender, receiver)) => {
                    senders.push(sender);
                    let (tx, rx) = mpsc::channel(CALL_QUEUE);
                    tokio::spawn(read_upstream(
                        backend.clone(),
                        self.streaming,
                        receiver,
                        tx,
                        self.ctx.child(),
                        self.deadline,
                    ));
                    upstreams.push(
                        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) })
                            .map(move |event| (index, event))
                            .boxed(),
                    );
                }
                Err(status) => {
                    warn!("{}: peer {} unreachable: {}", self.method, backend, status);
                    if responder.send(backend.build_error(self.streaming, &status)).await.is_err() {
                        return;
                    }
                    envelope.finish(index, status);
                }
            }
        }
        debug!("{} fanned out to {} peers", self.method, senders.len());

        let mut pump = tokio::spawn(pump_caller(inbound, senders, self.streaming, self.ctx.child()));
        let mut pumping = true;
        let mut merged = stream::select_all(upstreams);

        loop {
            tokio::select! {
                joined = &mut pump, if pumping => {
                    pumping = false;
                    if let Some(status) = caller_violation(joined) {
                        self.ctx.cancel();
                        responder.finish(status).await;
                        return;
                    }
                }
                event = merged.next() => match event {
                    None => break,
                    Some((_, Upstream::Message(message))) => {
                        if responder.send(message).await.is_err() {
                            debug!("{}: caller went away", self.method);
                            return;
                        }
                    }
                    Some((index, Upstream::Finished(status))) => {
                        if !status.is_ok() {
                            debug!("{}: peer {} failed: {}", self.method, backends[index], status);
                            if responder.send(backends[index].build_error(self.streaming, &status)).await.is_err() {
                                return;
                            }
                        }
                        envelope.finish(index, status);
                    }
                },
            }
        }

        let status = envelope.status();
        debug!("{:?} call {} finished: {}", envelope.mode, envelope.method, status);
        responder.finish(status).await;
    }
}

enum Upstream {
    Message(Bytes),
    Finished(Status),
}

/// Reads one upstream into its bounded queue. A full queue stalls only this
/// upstream.
async fn read_upstream(
    backend: Backend,
    streaming: bool,
    mut receiver: CallReceiver,
    tx: mpsc::Sender<Upstream>,
    ctx: Context,
    deadline: Option<Instant>,
) {
    let expired = expire_at(deadline);
    tokio::pin!(expired);

    loop {
        let event = tokio::select! {
            _ = ctx.cancelled() => {
                receiver.cancel();
                return;
            }
            _ = &mut expired => {
                receiver.cancel();
                Upstream::Finished(Status::deadline_exceeded(format!("{} did not finish before the deadline", backend)))
            }
            message = receiver.recv() => match message {
                Ok(Some(message)) => match tag_message(&backend, streaming, message) {
                    Ok(message) => Upstream::Message(message),
                    Err(status) => {
                        receiver.cancel();
                        Upstream::Finished(status)
                    }
                },
                Ok(None) => Upstream::Finished(Status::ok()),
                Err(status) => Upstream::Finished(status),
            },
        };

        let finished = matches!(event, Upstream::Finished(_));
        if tx.send(event).await.is_err() || finished {
            return;
        }
    }
}

/// Tags an upstream message, refusing one the tag would push past the frame limit.
fn tag_message(backend: &Backend, streaming: bool, message: Bytes) -> Result<Bytes, Status> {
    let tagged = backend.append_info(streaming, message);
    if tagged.len() > MAX_MESSAGE_SIZE {
        return Err(Status::resource_exhausted(format!(
            "{} sent a {} byte message, too large to tag",
            backend,
            tagged.len()
        )));
    }
    Ok(tagged)
}

/// Forwards the caller's messages to every upstream, then half-closes them.
/// Unary calls may carry a single request message.
async fn pump_caller(
    mut inbound: CallInbound,
    senders: Vec<CallSender>,
    streaming: bool,
    ctx: Context,
) -> Result<(), Status> {
    let mut received = 0usize;
    loop {
        let message = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        received += 1;
        if !streaming && received > 1 {
            return Err(Status::invalid_argument(
                "unary call carried more than one request message",
            ));
        }
        // A failed send shows up on that upstream's receiving side.
        join_all(senders.iter().map(|sender| sender.send(message.clone()))).await;
    }

    join_all(senders.iter().map(CallSender::close_send)).await;
    Ok(())
}

fn caller_violation(joined: Result<Result<(), Status>, JoinError>) -> Option<Status> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(status)) => Some(status),
        Err(e) => Some(Status::internal(format!("request forwarding failed: {}", e))),
    }
}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Per-peer bookkeeping for a fan-out call.
#[derive(Debug)]
struct CallEnvelope {
    method: String,
    mode: Mode,
    peers: Vec<String>,
    done: Vec<bool>,
    failures: Vec<(usize, Status)>,
}

impl CallEnvelope {
    fn new<'a>(method: &str, mode: Mode, peers: impl Iterator<Item = &'a str>) -> Self {
        let peers: Vec<String> = peers.map(str::to_owned).collect();
        Self {
            method: method.to_owned(),
            mode,
            done: vec![false; peers.len()],
            peers,
            failures: Vec::new(),
        }
    }

    /// Records the outcome of one peer. Later outcomes for the same peer are ignored.
    fn finish(&mut self, index: usize, status: Status) {
        match self.done.get_mut(index) {
            Some(done) if !*done => *done = true,
            _ => return,
        }
        if !status.is_ok() {
            self.failures.push((index, status));
        }
    }

    fn is_complete(&self) -> bool {
        self.done.iter().all(|done| *done)
    }

    /// OK when every peer finished cleanly, otherwise an `Unknown` status
    /// naming each failed peer.
    fn status(&self) -> Status {
        if self.failures.is_empty() && self.is_complete() {
            return Status::ok();
        }

        let mut reasons: Vec<String> = self
            .failures
            .iter()
            .map(|(index, status)| format!("{}: {}", self.peers[*index], status.message))
            .collect();
        reasons.extend(
            self.done
                .iter()
                .enumerate()
                .filter(|(_, done)| !**done)
                .map(|(index, _)| format!("{}: ended without a status", self.peers[index])),
        );

        Status::unknown(format!(
            "{} of {} peers failed: {}",
            reasons.len(),
            self.peers.len(),
            reasons.join("; ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Code;

    fn envelope(peers: &[&str]) -> CallEnvelope {
        CallEnvelope::new("/svc.A/Foo", Mode::OneToMany, peers.iter().copied())
    }

    #[test]
    fn all_peers_ok_is_ok() {
        let mut env = envelope(&["a", "b"]);
        env.finish(1, Status::ok());
        assert!(!env.is_complete());
        env.finish(0, Status::ok());

        assert!(env.is_complete());
        assert!(env.status().is_ok());
    }

    #[test]
    fn failures_are_listed_by_peer() {
        let mut env = envelope(&["a", "b", "c"]);
        env.finish(0, Status::unavailable("connection refused"));
        env.finish(1, Status::ok());
        env.finish(2, Status::deadline_exceeded("too slow"));

        let status = env.status();
        assert_eq!(status.code, Code::Unknown);
        assert_eq!(
            status.message,
            "2 of 3 peers failed: a: connection refused; c: too slow"
        );
    }

    #[test]
    fn first_outcome_per_peer_wins() {
        let mut env = envelope(&["a"]);
        env.finish(0, Status::ok());
        env.finish(0, Status::unavailable("late"));
        env.finish(7, Status::unavailable("no such peer"));

        assert!(env.status().is_ok());
    }

    #[test]
    fn unfinished_peers_count_as_failed() {
        let mut env = envelope(&["a", "b"]);
        env.finish(0, Status::ok());

        let status = env.status();
        assert_eq!(status.code, Code::Unknown);
        assert_eq!(status.message, "1 of 2 peers failed: b: ended without a status");
    }

    #[test]
    fn messages_too_large_to_tag_fail_their_peer() {
        let backend = Backend::Loopback(crate::proxy::LoopbackBackend::new("node-a", None));

        let tagged = tag_message(&backend, false, Bytes::from_static(b"hi")).unwrap();
        let (tag, payload) = crate::wire::PeerTag::split(&tagged).unwrap();
        assert_eq!(tag.peer, "node-a");
        assert_eq!(&payload[..], b"hi");

        let status = tag_message(&backend, false, Bytes::from(vec![0u8; MAX_MESSAGE_SIZE - 8])).unwrap_err();
        assert_eq!(status.code, Code::ResourceExhausted);
        assert!(status.message.contains("node-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_methods_have_no_default_deadline() {
        let handler = ProxyHandler::new(
            Director::new(
                std::sync::Arc::new(crate::proxy::BackendRegistry::new("self", 50000, None)),
                crate::observer::LocalAddresses::new(),
            ),
            StreamingDetector::with_methods(Vec::<String>::new()).unwrap(),
        );

        assert!(handler.deadline(None, true).is_none());

        let unary = handler.deadline(None, false).unwrap();
        assert_eq!(unary - Instant::now(), DEFAULT_UNARY_TIMEOUT);

        let requested = Instant::now() + Duration::from_secs(5);
        assert_eq!(handler.deadline(Some(requested), false), Some(requested));
    }
}
