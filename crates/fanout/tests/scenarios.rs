use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use fanout::{
    Backoff, Counter, FanoutConfig, FanoutCore, Processed, SessionParams, SessionReport,
};
use futures::{channel::mpsc, SinkExt, StreamExt};
use shared::{
    domain::{ClientId, ConversationId, EntryId, UserId},
    protocol::{ClientFrame, CloseReason, ServerFrame},
};
use storage::{GroupRead, LogStore, MemoryStore, NewLogEntry, Range, FANOUT_LOG_KEY};
use tokio::task::JoinHandle;

fn config(instance_id: &str) -> FanoutConfig {
    FanoutConfig {
        instance_id: instance_id.into(),
        consumer_loops: 2,
        block_timeout: Duration::from_millis(50),
        visibility_timeout: Duration::from_millis(200),
        max_deliveries: 3,
        dedup_ttl: Duration::from_secs(10),
        backoff: Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(20),
        },
        ..FanoutConfig::default()
    }
}

fn core(store: &MemoryStore, instance_id: &str) -> FanoutCore {
    FanoutCore::new(Arc::new(store.clone()), config(instance_id)).expect("valid config")
}

struct Socket {
    frames: mpsc::Receiver<ServerFrame>,
    input: mpsc::Sender<ClientFrame>,
    session: JoinHandle<SessionReport>,
}

impl Socket {
    fn open(core: &FanoutCore, params: SessionParams) -> Self {
        let (server_tx, frames) = mpsc::channel(256);
        let (input, client_rx) = mpsc::channel(8);
        let session = core.open_session(params, server_tx, client_rx);
        Self {
            frames,
            input,
            session,
        }
    }

    async fn next_frame(&mut self) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("frame in time")
            .expect("socket open")
    }

    async fn next_message(&mut self) -> EntryId {
        match self.next_frame().await {
            ServerFrame::Message { message } => message.entry_id,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    async fn sync_complete(&mut self) -> usize {
        match self.next_frame().await {
            ServerFrame::SyncComplete { delivered, .. } => delivered,
            other => panic!("expected sync_complete, got {other:?}"),
        }
    }

    async fn close(mut self) -> SessionReport {
        self.input.send(ClientFrame::Close).await.expect("close frame");
        tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("closed in time")
            .expect("join")
    }
}

fn params(user_id: UserId, client_id: ClientId, conversation_id: ConversationId) -> SessionParams {
    SessionParams {
        user_id,
        client_id,
        conversation_id,
    }
}

async fn publish(core: &FanoutCore, conversation_id: ConversationId, body: &[u8]) -> EntryId {
    core.publish(conversation_id, UserId::new_v4(), body.to_vec(), vec![0; 12])
        .await
        .expect("publish")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn offline_client_receives_the_whole_backlog_in_order() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let conversation_id = ConversationId::new_v4();
    let mut published = Vec::new();
    for body in [b"m1", b"m2", b"m3"] {
        published.push(publish(&core, conversation_id, body).await);
    }

    let (user_id, client_id) = (UserId::new_v4(), ClientId::new_v4());
    let mut socket = Socket::open(&core, params(user_id, client_id, conversation_id));
    for expected in &published {
        assert_eq!(socket.next_message().await, *expected);
    }
    assert_eq!(socket.sync_complete().await, 3);
    socket.close().await;

    let cursor = core
        .sync()
        .get_cursor(user_id, client_id)
        .await
        .expect("cursor")
        .expect("stored");
    assert_eq!(cursor.last_message_id, published[2]);
}

#[tokio::test]
async fn reconnecting_client_receives_only_what_it_missed() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let _tasks = core.start().await.expect("start");
    let conversation_id = ConversationId::new_v4();
    let (user_id, client_id) = (UserId::new_v4(), ClientId::new_v4());

    let mut socket = Socket::open(&core, params(user_id, client_id, conversation_id));
    assert_eq!(socket.sync_complete().await, 0);
    let m1 = publish(&core, conversation_id, b"m1").await;
    assert_eq!(socket.next_message().await, m1);
    let report = socket.close().await;
    assert_eq!(report.live_delivered, 1);

    let m2 = publish(&core, conversation_id, b"m2").await;
    let m3 = publish(&core, conversation_id, b"m3").await;

    let mut socket = Socket::open(&core, params(user_id, client_id, conversation_id));
    assert_eq!(socket.next_message().await, m2);
    assert_eq!(socket.next_message().await, m3);
    assert_eq!(socket.sync_complete().await, 2);
    let report = socket.close().await;
    assert_eq!(report.backlog_delivered, 2);
    assert_eq!(report.live_delivered, 0);
    core.shutdown();
}

#[tokio::test]
async fn every_instance_acks_but_only_the_connected_one_delivers() {
    let store = MemoryStore::new();
    let connected = core(&store, "a");
    let bystander = core(&store, "b");
    let _a = connected.start().await.expect("start a");
    let _b = bystander.start().await.expect("start b");
    let conversation_id = ConversationId::new_v4();

    let mut socket = Socket::open(
        &connected,
        params(UserId::new_v4(), ClientId::new_v4(), conversation_id),
    );
    socket.sync_complete().await;
    let m4 = publish(&bystander, conversation_id, b"m4").await;
    assert_eq!(socket.next_message().await, m4);
    let pointer_id = store
        .range(FANOUT_LOG_KEY, Range::all())
        .await
        .expect("fan-out log")
        .last()
        .map(|pointer| pointer.entry_id)
        .expect("pointer");

    for core in [&connected, &bystander] {
        let group = core.group_name();
        eventually(|| {
            let store = store.clone();
            let group = group.clone();
            async move {
                let pending = store.pending(&group).await.expect("pending");
                let info = store.groups().await.expect("groups");
                pending.is_empty()
                    && info
                        .iter()
                        .any(|candidate| candidate.name == group && candidate.last_delivered_id == pointer_id)
            }
        })
        .await;
    }
    assert_eq!(connected.metrics().get(Counter::Delivered), 1);
    assert_eq!(bystander.metrics().get(Counter::Delivered), 0);
    assert!(bystander.metrics().get(Counter::PointersProcessed) >= 1);

    let report = socket.close().await;
    assert_eq!(report.close_reason, Some(CloseReason::ClientClosed));
    connected.shutdown();
    bystander.shutdown();
}

#[tokio::test(start_paused = true)]
async fn crashed_member_entries_are_redelivered_and_broadcast_once() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let group = core.group_name();
    core.consumer(0).ensure_group().await.expect("group");
    let conversation_id = ConversationId::new_v4();
    let mut subscription = core.hub().subscribe(conversation_id, UserId::new_v4());
    let m5 = publish(&core, conversation_id, b"m5").await;

    // member 0 reads m5 and dies before acking
    let read = GroupRead {
        count: 10,
        block: Duration::ZERO,
        claim_idle: core.config().visibility_timeout,
    };
    let crashed = store
        .read_group(&group, &core.config().member_name(0), read)
        .await
        .expect("read");
    assert_eq!(crashed.len(), 1);

    let survivor = core.consumer(1);
    assert_eq!(survivor.poll_once().await.expect("too early"), 0);
    tokio::time::advance(core.config().visibility_timeout).await;
    assert_eq!(survivor.poll_once().await.expect("redelivered"), 1);

    // the original member comes back and finishes its batch
    let resumed = core.consumer(0);
    let entry = crashed.into_iter().next().expect("entry");
    assert_eq!(resumed.process(entry).await, Processed::Duplicate);

    match subscription.try_recv() {
        Some(fanout::Delivery::Message(message)) => assert_eq!(message.entry_id, m5),
        other => panic!("expected m5, got {other:?}"),
    }
    assert!(subscription.try_recv().is_none());
    assert!(store.pending(&group).await.expect("pending").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_arrive_in_log_order_without_gaps() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let _tasks = core.start().await.expect("start");
    let conversation_id = ConversationId::new_v4();
    let mut socket = Socket::open(
        &core,
        params(UserId::new_v4(), ClientId::new_v4(), conversation_id),
    );
    socket.sync_complete().await;

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let core = core.clone();
            tokio::spawn(async move {
                for n in 0..25 {
                    let body = format!("{writer}-{n}");
                    publish(&core, conversation_id, body.as_bytes()).await;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.expect("writer");
    }

    let mut received = Vec::new();
    while received.len() < 100 {
        received.push(socket.next_message().await);
    }
    assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(received.iter().collect::<HashSet<_>>().len(), 100);
    socket.close().await;
    core.shutdown();
}

#[tokio::test]
async fn offline_recipients_are_counted_unless_connected_here() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let conversation_id = ConversationId::new_v4();
    let (online, offline) = (UserId::new_v4(), UserId::new_v4());
    let _online_session = core.hub().subscribe(conversation_id, online);

    let message = NewLogEntry {
        conversation_id,
        sender_id: UserId::new_v4(),
        ciphertext: b"hi".to_vec(),
        nonce: vec![0; 12],
        created_at: Utc::now(),
    };
    core.publish_with_offline(message, &[online, offline])
        .await
        .expect("publish");

    assert_eq!(core.sync().offline_count(offline, conversation_id).await.expect("count"), 1);
    assert_eq!(core.sync().offline_count(online, conversation_id).await.expect("count"), 0);
}

fn message(conversation_id: ConversationId, body: &[u8]) -> NewLogEntry {
    NewLogEntry {
        conversation_id,
        sender_id: UserId::new_v4(),
        ciphertext: body.to_vec(),
        nonce: vec![0; 12],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn recipients_connected_to_another_instance_are_not_counted_offline() {
    let store = MemoryStore::new();
    let (a, b) = (core(&store, "a"), core(&store, "b"));
    let conversation_id = ConversationId::new_v4();
    let (connected, absent) = (UserId::new_v4(), UserId::new_v4());
    let client_id = ClientId::new_v4();

    let mut socket = Socket::open(&a, params(connected, client_id, conversation_id));
    assert_eq!(socket.sync_complete().await, 0);

    b.publish_with_offline(message(conversation_id, b"first"), &[connected, absent])
        .await
        .expect("publish");
    assert_eq!(b.sync().offline_count(connected, conversation_id).await.expect("count"), 0);
    assert_eq!(b.sync().offline_count(absent, conversation_id).await.expect("count"), 1);

    // once the session on a closes, b counts the user as offline again
    let report = socket.close().await;
    assert_eq!(report.close_reason, Some(CloseReason::ClientClosed));
    assert!(!b.sync().is_present(connected, conversation_id).await.expect("presence"));
    b.publish_with_offline(message(conversation_id, b"second"), &[connected])
        .await
        .expect("publish");
    assert_eq!(b.sync().offline_count(connected, conversation_id).await.expect("count"), 1);
}

#[tokio::test]
async fn snapshot_reports_subscribers_and_leave_drops_the_group() {
    let store = MemoryStore::new();
    let core = core(&store, "a");
    let tasks = core.start().await.expect("start");
    let conversation_id = ConversationId::new_v4();
    let mut socket = Socket::open(
        &core,
        params(UserId::new_v4(), ClientId::new_v4(), conversation_id),
    );
    socket.sync_complete().await;

    let snapshot = core.metrics_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.group, "fanout-a");
    assert_eq!(snapshot.subscribers.get(&conversation_id), Some(&1));
    assert_eq!(snapshot.counters.sessions_opened, 1);

    core.shutdown();
    assert!(matches!(
        socket.next_frame().await,
        ServerFrame::Closing {
            reason: CloseReason::ServerShutdown
        }
    ));
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stopped in time")
            .expect("join");
    }
    assert!(core.leave().await.expect("leave"));
    assert!(store.groups().await.expect("groups").is_empty());
}
