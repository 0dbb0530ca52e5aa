//! One client connection, driven through
//! `Connecting -> Registered -> Syncing -> Live -> Closing -> Closed`.
//!
//! The hub subscription is taken before the backlog is read, so nothing published during
//! the replay can slip between the two. Live deliveries only tell the session that the log
//! grew: it then reads `(last sent, delivered id]` from the conversation log, which keeps
//! the socket in log order even when pointers arrive out of order.

use std::{fmt::Display, sync::Arc, time::Duration};

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use shared::{
    domain::{ClientId, ConversationId, EntryId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, CloseReason, ServerFrame},
};
use storage::StoreError;

use crate::{
    hub::{BroadcastHub, Delivery, Subscription},
    metrics::{Counter, FanoutMetrics},
    sync::OfflineSync,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket send failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a finished session did. `error` is set when it ended on a failure rather than a
/// close reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub backlog_delivered: usize,
    pub live_delivered: usize,
    pub last_sent: Option<EntryId>,
    pub close_reason: Option<CloseReason>,
    pub error: Option<String>,
}

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    hub: BroadcastHub,
    sync: OfflineSync,
    metrics: Arc<FanoutMetrics>,
    page_size: usize,
    idle_timeout: Duration,
}

impl SessionContext {
    pub fn new(
        hub: BroadcastHub,
        sync: OfflineSync,
        metrics: Arc<FanoutMetrics>,
        page_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            sync,
            metrics,
            page_size: page_size.max(1),
            idle_timeout,
        }
    }

    /// Presence outlives the idle deadline, which a refresh always precedes.
    fn presence_ttl(&self) -> Duration {
        self.idle_timeout.saturating_mul(2)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    /// Newest entry the client holds: its cursor at first, then whatever was sent.
    position: Option<EntryId>,
    /// What the stored cursor holds, as far as this session knows.
    persisted: Option<EntryId>,
    backlog_delivered: usize,
    live_delivered: usize,
}

pub struct Connecting;

pub struct Registered {
    subscription: Subscription,
}

pub struct Syncing {
    subscription: Subscription,
}

pub struct Live {
    subscription: Subscription,
}

pub struct Closing {
    subscription: Subscription,
    reason: CloseReason,
    /// False when the client stream already ended; there is nobody to tell.
    notify_client: bool,
}

pub struct Session<S> {
    ctx: SessionContext,
    params: SessionParams,
    progress: Progress,
    state: S,
}

/// A session that failed before reaching `Closing`. Its subscription is already gone.
pub struct Aborted {
    params: SessionParams,
    progress: Progress,
    error: SessionError,
}

impl Session<Connecting> {
    pub fn new(ctx: SessionContext, params: SessionParams) -> Self {
        Self {
            ctx,
            params,
            progress: Progress::default(),
            state: Connecting,
        }
    }

    pub fn register(self) -> Session<Registered> {
        let SessionParams {
            user_id,
            client_id,
            conversation_id,
        } = self.params;
        let subscription = self.ctx.hub.subscribe(conversation_id, user_id);
        self.ctx.metrics.incr(Counter::SessionsOpened);
        info!(%user_id, %client_id, %conversation_id, "session registered");
        self.advance(Registered { subscription })
    }
}

impl Session<Registered> {
    /// Loads the client's cursor. A cursor for another conversation is ignored and the
    /// client replays this one from the start.
    pub async fn load_cursor(mut self) -> Result<Session<Syncing>, Aborted> {
        mark_present(&self.ctx, &self.params).await;
        let cursor = match self
            .ctx
            .sync
            .get_cursor(self.params.user_id, self.params.client_id)
            .await
        {
            Ok(cursor) => cursor,
            Err(error) => return Err(self.abort(error.into())),
        };
        self.progress.position = cursor
            .filter(|cursor| cursor.conversation_id == self.params.conversation_id)
            .map(|cursor| cursor.last_message_id);
        self.progress.persisted = self.progress.position;
        debug!(
            user_id = %self.params.user_id,
            client_id = %self.params.client_id,
            resume_after = ?self.progress.position,
            "cursor loaded"
        );
        let Registered { subscription } = self.state;
        Ok(Session {
            ctx: self.ctx,
            params: self.params,
            progress: self.progress,
            state: Syncing { subscription },
        })
    }
}

impl Session<Syncing> {
    /// Sends everything after the cursor, then `SyncComplete`.
    pub async fn replay<Si>(mut self, sink: &mut Si) -> Result<Session<Live>, Aborted>
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
    {
        let conversation_id = self.params.conversation_id;
        let sent = match send_window(
            &self.ctx,
            &self.params,
            sink,
            &mut self.progress,
            None,
        )
        .await
        {
            Ok(sent) => sent,
            Err(error) => return Err(self.abort(error)),
        };
        persist_cursor(&self.ctx, &self.params, &mut self.progress).await;

        let complete = ServerFrame::SyncComplete {
            conversation_id,
            last_message_id: self.progress.position,
            delivered: sent,
        };
        if let Err(error) = sink.send(complete).await {
            return Err(self.abort(SessionError::Transport(error.to_string())));
        }
        if let Err(error) = self
            .ctx
            .sync
            .clear_offline(self.params.user_id, &[conversation_id])
            .await
        {
            warn!(user_id = %self.params.user_id, %conversation_id, %error, "failed to clear offline counter");
        }
        debug!(
            user_id = %self.params.user_id,
            client_id = %self.params.client_id,
            %conversation_id,
            backlog = sent,
            "backlog replayed"
        );

        let Syncing { subscription } = self.state;
        Ok(Session {
            ctx: self.ctx,
            params: self.params,
            progress: self.progress,
            state: Live { subscription },
        })
    }
}

impl Session<Live> {
    /// Pumps live deliveries and client frames until something ends the session.
    pub async fn run<Si, St>(
        self,
        sink: &mut Si,
        stream: &mut St,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Session<Closing>, Aborted>
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
        St: Stream<Item = ClientFrame> + Unpin,
    {
        let Session {
            ctx,
            params,
            mut progress,
            state: Live { mut subscription },
        } = self;
        let mut deadline = Instant::now() + ctx.idle_timeout;
        let mut presence_marked = Instant::now();
        let mut notify_client = true;

        let reason = loop {
            if *shutdown.borrow() {
                break CloseReason::ServerShutdown;
            }
            let step = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break CloseReason::ServerShutdown;
                    }
                    Ok(())
                }
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => {
                        on_delivery(&ctx, &params, &mut subscription, sink, &mut progress, delivery)
                            .await
                    }
                    None if subscription.is_evicted() => break CloseReason::SlowConsumer,
                    None => break CloseReason::ServerShutdown,
                },
                frame = stream.next() => match frame {
                    Some(ClientFrame::Close) => break CloseReason::ClientClosed,
                    Some(frame) => {
                        let now = Instant::now();
                        deadline = now + ctx.idle_timeout;
                        if now.duration_since(presence_marked) >= ctx.idle_timeout / 2 {
                            mark_present(&ctx, &params).await;
                            presence_marked = now;
                        }
                        on_client_frame(&ctx, &params, sink, frame).await
                    }
                    None => {
                        notify_client = false;
                        break CloseReason::ClientClosed;
                    }
                },
                _ = sleep_until(deadline) => break CloseReason::IdleTimeout,
            };
            if let Err(error) = step {
                drop(subscription);
                return Err(Aborted {
                    params,
                    progress,
                    error,
                });
            }
        };

        Ok(Session {
            ctx,
            params,
            progress,
            state: Closing {
                subscription,
                reason,
                notify_client,
            },
        })
    }
}

impl Session<Closing> {
    /// Best-effort `Closing` frame, then unregisters. Never fails.
    pub async fn close<Si>(self, sink: &mut Si) -> SessionReport
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
    {
        let Closing {
            subscription,
            reason,
            notify_client,
        } = self.state;
        self.ctx.hub.unsubscribe(subscription);
        clear_presence(&self.ctx, &self.params).await;
        if notify_client {
            if let Err(error) = sink.send(ServerFrame::Closing { reason }).await {
                debug!(user_id = %self.params.user_id, %error, "closing frame not delivered");
            }
        }
        if let Err(error) = sink.close().await {
            debug!(user_id = %self.params.user_id, %error, "socket close failed");
        }
        self.ctx.metrics.incr(Counter::SessionsClosed);
        info!(
            user_id = %self.params.user_id,
            client_id = %self.params.client_id,
            conversation_id = %self.params.conversation_id,
            ?reason,
            backlog = self.progress.backlog_delivered,
            live = self.progress.live_delivered,
            "session closed"
        );
        report(&self.params, &self.progress, Some(reason), None)
    }
}

impl<S> Session<S> {
    pub fn last_sent(&self) -> Option<EntryId> {
        self.progress.position
    }

    fn advance<N>(self, state: N) -> Session<N> {
        Session {
            ctx: self.ctx,
            params: self.params,
            progress: self.progress,
            state,
        }
    }

    fn abort(self, error: SessionError) -> Aborted {
        Aborted {
            params: self.params,
            progress: self.progress,
            error,
        }
    }
}

/// Runs a session from registration to close over any frame sink and stream.
pub async fn run_session<Si, St>(
    ctx: SessionContext,
    params: SessionParams,
    mut sink: Si,
    mut stream: St,
    shutdown: watch::Receiver<bool>,
) -> SessionReport
where
    Si: Sink<ServerFrame> + Unpin,
    Si::Error: Display,
    St: Stream<Item = ClientFrame> + Unpin,
{
    let registered = Session::new(ctx.clone(), params).register();
    match drive(registered, &mut sink, &mut stream, shutdown).await {
        Ok(closing) => closing.close(&mut sink).await,
        Err(mut aborted) => {
            // whatever reached the client before the failure stays delivered
            persist_cursor(&ctx, &aborted.params, &mut aborted.progress).await;
            clear_presence(&ctx, &aborted.params).await;
            warn!(
                user_id = %aborted.params.user_id,
                client_id = %aborted.params.client_id,
                conversation_id = %aborted.params.conversation_id,
                error = %aborted.error,
                "session aborted"
            );
            if let SessionError::Store(error) = &aborted.error {
                let frame = ServerFrame::Error(ApiError::new(ErrorCode::Unavailable, error.to_string()));
                if let Err(error) = sink.send(frame).await {
                    debug!(%error, "error frame not delivered");
                }
            }
            if let Err(error) = sink.close().await {
                debug!(%error, "socket close failed");
            }
            ctx.metrics.incr(Counter::SessionsClosed);
            report(
                &aborted.params,
                &aborted.progress,
                None,
                Some(aborted.error.to_string()),
            )
        }
    }
}

async fn drive<Si, St>(
    registered: Session<Registered>,
    sink: &mut Si,
    stream: &mut St,
    shutdown: watch::Receiver<bool>,
) -> Result<Session<Closing>, Aborted>
where
    Si: Sink<ServerFrame> + Unpin,
    Si::Error: Display,
    St: Stream<Item = ClientFrame> + Unpin,
{
    let syncing = registered.load_cursor().await?;
    let live = syncing.replay(sink).await?;
    live.run(sink, stream, shutdown).await
}

fn report(
    params: &SessionParams,
    progress: &Progress,
    close_reason: Option<CloseReason>,
    error: Option<String>,
) -> SessionReport {
    SessionReport {
        user_id: params.user_id,
        client_id: params.client_id,
        conversation_id: params.conversation_id,
        backlog_delivered: progress.backlog_delivered,
        live_delivered: progress.live_delivered,
        last_sent: progress.position,
        close_reason,
        error,
    }
}

/// Sends log entries after `progress.position`, up to `until` when given, page by page.
/// Without `until` this is the backlog replay; with it every send is a live delivery and
/// the cursor follows each one.
async fn send_window<Si>(
    ctx: &SessionContext,
    params: &SessionParams,
    sink: &mut Si,
    progress: &mut Progress,
    until: Option<EntryId>,
) -> Result<usize, SessionError>
where
    Si: Sink<ServerFrame> + Unpin,
    Si::Error: Display,
{
    let conversation_id = params.conversation_id;
    let mut sent = 0;
    loop {
        let page = match until {
            Some(until) => {
                ctx.sync
                    .get_between(conversation_id, progress.position, until, ctx.page_size)
                    .await?
            }
            None => {
                ctx.sync
                    .get_since_page(conversation_id, progress.position, ctx.page_size)
                    .await?
            }
        };
        for entry in &page.entries {
            sink.send(ServerFrame::Message {
                message: entry.to_payload(),
            })
            .await
            .map_err(|error| SessionError::Transport(error.to_string()))?;
            progress.position = Some(entry.entry_id);
            sent += 1;
            if until.is_some() {
                progress.live_delivered += 1;
                ctx.metrics.incr(Counter::LiveDelivered);
                persist_cursor(ctx, params, progress).await;
            } else {
                progress.backlog_delivered += 1;
                ctx.metrics.incr(Counter::BacklogDelivered);
            }
        }
        if page.last_scanned.is_some() {
            progress.position = page.last_scanned;
        }
        if page.scanned < ctx.page_size {
            return Ok(sent);
        }
    }
}

/// Stores `progress.position` unless the stored cursor already holds it.
async fn persist_cursor(ctx: &SessionContext, params: &SessionParams, progress: &mut Progress) {
    let Some(position) = progress.position else {
        return;
    };
    if progress.persisted >= Some(position) {
        return;
    }
    let updated = ctx
        .sync
        .update_cursor(
            params.user_id,
            params.client_id,
            params.conversation_id,
            position,
        )
        .await;
    match updated {
        Ok(_) => progress.persisted = Some(position),
        // the client will be replayed a little more on reconnect
        Err(error) => {
            warn!(user_id = %params.user_id, client_id = %params.client_id, %error, "cursor update failed")
        }
    }
}

async fn mark_present(ctx: &SessionContext, params: &SessionParams) {
    let marked = ctx
        .sync
        .mark_present(
            params.user_id,
            params.client_id,
            params.conversation_id,
            ctx.presence_ttl(),
        )
        .await;
    if let Err(error) = marked {
        // other instances may count this user as offline until the next refresh
        warn!(user_id = %params.user_id, client_id = %params.client_id, %error, "presence update failed");
    }
}

async fn clear_presence(ctx: &SessionContext, params: &SessionParams) {
    let cleared = ctx
        .sync
        .clear_presence(params.user_id, params.client_id, params.conversation_id)
        .await;
    if let Err(error) = cleared {
        debug!(user_id = %params.user_id, client_id = %params.client_id, %error, "presence left to expire");
    }
}

async fn on_delivery<Si>(
    ctx: &SessionContext,
    params: &SessionParams,
    subscription: &mut Subscription,
    sink: &mut Si,
    progress: &mut Progress,
    first: Delivery,
) -> Result<(), SessionError>
where
    Si: Sink<ServerFrame> + Unpin,
    Si::Error: Display,
{
    let mut newest: Option<EntryId> = None;
    let mut typing = Vec::new();
    let mut next = Some(first);
    let mut drained = 0;
    while let Some(delivery) = next {
        match delivery {
            Delivery::Message(entry) if entry.conversation_id == params.conversation_id => {
                newest = newest.max(Some(entry.entry_id));
            }
            Delivery::Message(_) => {}
            Delivery::Typing {
                conversation_id,
                user_id,
            } if user_id != params.user_id => {
                typing.push(ServerFrame::Typing {
                    conversation_id,
                    user_id,
                });
            }
            Delivery::Typing { .. } => {}
        }
        drained += 1;
        next = if drained < ctx.page_size {
            subscription.try_recv()
        } else {
            None
        };
    }

    if let Some(newest) = newest.filter(|newest| progress.position < Some(*newest)) {
        send_window(ctx, params, sink, progress, Some(newest)).await?;
        // entries skipped as undecodable still move the cursor
        persist_cursor(ctx, params, progress).await;
    }
    for frame in typing {
        sink.send(frame)
            .await
            .map_err(|error| SessionError::Transport(error.to_string()))?;
    }
    Ok(())
}

async fn on_client_frame<Si>(
    ctx: &SessionContext,
    params: &SessionParams,
    sink: &mut Si,
    frame: ClientFrame,
) -> Result<(), SessionError>
where
    Si: Sink<ServerFrame> + Unpin,
    Si::Error: Display,
{
    match frame {
        ClientFrame::Ack { entry_id } => {
            trace!(user_id = %params.user_id, client_id = %params.client_id, %entry_id, "client ack");
        }
        ClientFrame::Typing => {
            ctx.hub.broadcast(
                params.conversation_id,
                Delivery::Typing {
                    conversation_id: params.conversation_id,
                    user_id: params.user_id,
                },
            );
        }
        ClientFrame::Ping => {
            sink.send(ServerFrame::Pong)
                .await
                .map_err(|error| SessionError::Transport(error.to_string()))?;
        }
        ClientFrame::Close => {}
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
