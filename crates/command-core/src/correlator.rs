//! Request/response correlation.
//!
//! Every request is keyed by [`CorrelationKey`]. Only one request per key is
//! on the wire at a time; later requests for the same key wait on a per-key
//! gate and go out in turn. Each attempt waits the family's response timeout,
//! and after `max_attempts` sends without an answer the request fails with
//! [`Error::ResponseTimeout`] and leaves nothing behind in the table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use camlink_transport_core::{Endpoint, EndpointId, PacketType};
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore, broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::CorrelatorConfig;
use crate::envelope::{CommandEnvelope, EnvelopeKind, MessageFamily};
use crate::error::Error;
use crate::key::CorrelationKey;
use crate::Result;

/// Identifies whoever issued a request, normally a session
pub type OwnerId = u64;

const CANCEL_CHANNEL_CAPACITY: usize = 64;

/// Where encoded requests go
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_envelope(&self, envelope: &CommandEnvelope) -> Result<()>;
}

#[async_trait]
impl CommandSink for Endpoint {
    async fn send_envelope(&self, envelope: &CommandEnvelope) -> Result<()> {
        self.send_body(PacketType::Control, envelope.encode()?).await?;
        Ok(())
    }
}

/// Snapshot of an in-flight request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub key: CorrelationKey,
    pub device_id: String,
    pub owner: Option<OwnerId>,
    pub issued_at: Instant,
    /// Sends so far
    pub attempts: u32,
}

enum Outcome {
    Response(CommandEnvelope),
    Cancelled,
}

struct PendingEntry {
    ticket: u64,
    info: PendingCommand,
    waiter: Option<oneshot::Sender<Outcome>>,
}

/// Per-request timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Wait per attempt
    pub timeout: Duration,
    /// Total sends
    pub attempts: u32,
}

/// Removes a request's traces when it finishes or is dropped
struct Cleanup<'a> {
    correlator: &'a CommandCorrelator,
    key: CorrelationKey,
    ticket: Option<u64>,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            self.correlator
                .pending
                .remove_if(&self.key, |_, entry| entry.ticket == ticket);
        }
        self.correlator
            .gates
            .remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 1);
        self.correlator.idle.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy)]
enum CancelScope {
    Channel(EndpointId),
    Owner(OwnerId),
}

impl CancelScope {
    fn matches(self, channel: EndpointId, owner: Option<OwnerId>) -> bool {
        match self {
            CancelScope::Channel(c) => c == channel,
            CancelScope::Owner(o) => owner == Some(o),
        }
    }
}

/// Matches device responses to the requests that caused them
pub struct CommandCorrelator {
    config: CorrelatorConfig,
    pending: DashMap<CorrelationKey, PendingEntry>,
    gates: DashMap<CorrelationKey, Arc<Semaphore>>,
    next_ticket: AtomicU64,
    cancel_tx: broadcast::Sender<CancelScope>,
    idle: Notify,
}

impl std::fmt::Debug for CommandCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCorrelator")
            .field("pending", &self.pending.len())
            .field("gates", &self.gates.len())
            .finish()
    }
}

impl CommandCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        let (cancel_tx, _) = broadcast::channel(CANCEL_CHANNEL_CAPACITY);
        Self {
            config,
            pending: DashMap::new(),
            gates: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            cancel_tx,
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Timeout and attempt budget for a request in `family`
    pub fn options_for(&self, family: MessageFamily) -> RequestOptions {
        RequestOptions {
            timeout: self.config.timeout_for(family),
            attempts: self.config.max_attempts.max(1),
        }
    }

    /// Send `envelope` over `sink` and wait for the matching response.
    ///
    /// The response is returned whatever its result code; interpreting a
    /// device-side failure is up to the caller.
    pub async fn request(
        &self,
        sink: &dyn CommandSink,
        channel: EndpointId,
        envelope: CommandEnvelope,
        owner: Option<OwnerId>,
    ) -> Result<CommandEnvelope> {
        let options = self.options_for(envelope.code.family);
        self.request_with(sink, channel, envelope, owner, options).await
    }

    /// Like [`CommandCorrelator::request`] with explicit timing.
    ///
    /// Dropping the returned future removes the request from the table.
    pub async fn request_with(
        &self,
        sink: &dyn CommandSink,
        channel: EndpointId,
        mut envelope: CommandEnvelope,
        owner: Option<OwnerId>,
        options: RequestOptions,
    ) -> Result<CommandEnvelope> {
        envelope.kind = EnvelopeKind::Request;
        let key = CorrelationKey::for_envelope(channel, &envelope);
        let mut cleanup = Cleanup {
            correlator: self,
            key,
            ticket: None,
        };
        let mut cancels = self.cancel_tx.subscribe();

        let gate = self
            .gates
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let _permit = tokio::select! {
            biased;
            _ = wait_for_cancel(&mut cancels, channel, owner) => {
                debug!(%key, "queued command cancelled");
                return Err(Error::Cancelled);
            }
            permit = gate.clone().acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            key,
            PendingEntry {
                ticket,
                info: PendingCommand {
                    key,
                    device_id: envelope.device_id.clone(),
                    owner,
                    issued_at: Instant::now(),
                    attempts: 0,
                },
                waiter: Some(tx),
            },
        );
        cleanup.ticket = Some(ticket);

        let attempts = options.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(mut entry) = self.pending.get_mut(&key) {
                if entry.ticket == ticket {
                    entry.info.attempts = attempt;
                }
            }

            if let Err(e) = sink.send_envelope(&envelope).await {
                warn!(%key, attempt, error = %e, "command send failed");
                return Err(e);
            }
            trace!(%key, attempt, "command sent");

            // the cancel table scan can miss a request that was just admitted
            let waited = tokio::select! {
                biased;
                _ = wait_for_cancel(&mut cancels, channel, owner) => {
                    debug!(%key, attempt, "in-flight command cancelled");
                    return Err(Error::Cancelled);
                }
                waited = tokio::time::timeout(options.timeout, &mut rx) => waited,
            };
            match waited {
                Ok(Ok(Outcome::Response(response))) => return Ok(response),
                Ok(Ok(Outcome::Cancelled)) | Ok(Err(_)) => return Err(Error::Cancelled),
                Err(_) => debug!(%key, attempt, max_attempts = attempts, "no response yet"),
            }
        }

        warn!(%key, device_id = %envelope.device_id, attempts, "command timed out");
        Err(Error::ResponseTimeout {
            code: key.code,
            attempts,
        })
    }

    /// Hand a response to whoever is waiting for it.
    ///
    /// Returns `false` when nothing is pending for its key.
    pub fn resolve(&self, channel: EndpointId, response: CommandEnvelope) -> bool {
        let key = CorrelationKey::for_envelope(channel, &response);
        match self.pending.remove(&key) {
            Some((_, mut entry)) => {
                trace!(%key, result = response.result, "command resolved");
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Outcome::Response(response));
                }
                true
            }
            None => {
                debug!(%key, device_id = %response.device_id, "response with unknown correlation, dropping");
                false
            }
        }
    }

    /// Cancel everything issued by `owner`, queued requests included.
    /// Returns the number of in-flight requests cancelled.
    pub fn cancel_owned_by(&self, owner: OwnerId) -> usize {
        self.cancel(CancelScope::Owner(owner))
    }

    /// Cancel everything on `channel`, for endpoint teardown
    pub fn cancel_channel(&self, channel: EndpointId) -> usize {
        self.cancel(CancelScope::Channel(channel))
    }

    fn cancel(&self, scope: CancelScope) -> usize {
        let _ = self.cancel_tx.send(scope);
        let keys: Vec<CorrelationKey> = self
            .pending
            .iter()
            .filter(|entry| scope.matches(entry.key().channel, entry.info.owner))
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for key in keys {
            if let Some((_, mut entry)) = self.pending.remove(&key) {
                if let Some(waiter) = entry.waiter.take() {
                    let _ = waiter.send(Outcome::Cancelled);
                }
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(?scope, cancelled, "pending commands cancelled");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for_channel(&self, channel: EndpointId) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.key().channel == channel)
            .count()
    }

    /// Requests on `channel` that are in flight or queued
    pub fn busy_on_channel(&self, channel: EndpointId) -> bool {
        self.pending_for_channel(channel) > 0
            || self.gates.iter().any(|gate| gate.key().channel == channel)
    }

    pub fn pending(&self) -> Vec<PendingCommand> {
        self.pending.iter().map(|entry| entry.info.clone()).collect()
    }

    /// Resolve once nothing is in flight or queued on `channel`
    pub async fn wait_idle(&self, channel: EndpointId) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.busy_on_channel(channel) {
                return;
            }
            notified.await;
        }
    }
}

async fn wait_for_cancel(
    cancels: &mut broadcast::Receiver<CancelScope>,
    channel: EndpointId,
    owner: Option<OwnerId>,
) {
    loop {
        match cancels.recv().await {
            Ok(scope) if scope.matches(channel, owner) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CommandCode, MessageFamily};

    struct NullSink;

    #[async_trait]
    impl CommandSink for NullSink {
        async fn send_envelope(&self, _envelope: &CommandEnvelope) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unknown_response_is_dropped() {
        let correlator = CommandCorrelator::new(CorrelatorConfig::default());
        let response = CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigGet, 1), "D1")
            .response(0, Default::default());
        assert!(!correlator.resolve(EndpointId(1), response));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_hears_cancel_broadcast() {
        let correlator = Arc::new(CommandCorrelator::new(CorrelatorConfig::default()));
        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let env = CommandEnvelope::request(CommandCode::new(MessageFamily::LiveStream, 7), "D1");
                correlator.request(&NullSink, EndpointId(1), env, Some(9)).await
            })
        };
        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        // admitted after the table scan: only the broadcast reaches it
        let _ = correlator.cancel_tx.send(CancelScope::Owner(9));
        assert_eq!(task.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_returns_after_timeout() {
        let correlator = Arc::new(CommandCorrelator::new(CorrelatorConfig {
            response_timeout_ms: 100,
            max_attempts: 1,
            ..Default::default()
        }));
        let channel = EndpointId(9);
        correlator.wait_idle(channel).await;

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let env = CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigGet, 1), "D1");
                correlator.request(&NullSink, channel, env, None).await
            })
        };
        tokio::task::yield_now().await;
        assert!(correlator.busy_on_channel(channel));

        correlator.wait_idle(channel).await;
        assert!(!correlator.busy_on_channel(channel));
        assert!(matches!(task.await.unwrap(), Err(Error::ResponseTimeout { attempts: 1, .. })));
    }
}
