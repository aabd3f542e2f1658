//! The delivery client on its own task.
//!
//! One task owns the client, the transport and the single poll timer, and
//! handles one input at a time: a command, a timer fire, a fetch result or a
//! pushed event. Shutting down (or dropping the handle) cancels all of it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::sse::PushEvent;
use super::{DeliveryClient, DeliveryPhase, InboxSource, PollSource, PushSource, Schedule};
use crate::presenter::Presenter;
use crate::state::ChatMessage;
use crate::transcript::ConversationContext;

#[derive(Debug)]
pub enum Command {
    Activity,
    VoiceActive(bool),
    ChatActive(bool),
    Record(ChatMessage),
    Clear,
    Context(oneshot::Sender<ConversationContext>),
    Shutdown,
}

/// Snapshot published after every input, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub phase: DeliveryPhase,
    pub transport: &'static str,
    pub poll_interval_ms: u64,
    pub consecutive_empty_polls: u32,
    pub connected: bool,
    pub transcript_len: usize,
}

impl DeliveryStatus {
    fn offline() -> Self {
        Self {
            phase: DeliveryPhase::Uninitialized,
            transport: "none",
            poll_interval_ms: 0,
            consecutive_empty_polls: 0,
            connected: false,
            transcript_len: 0,
        }
    }
}

enum Effect {
    None,
    Activity { resumed: bool },
    Shutdown,
}

pub struct DeliveryTask<P: Presenter> {
    client: DeliveryClient<P>,
    rx: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<DeliveryStatus>,
    transport: &'static str,
    connected: bool,
}

impl<P: Presenter + Send + 'static> DeliveryTask<P> {
    /// Starts delivery for the client's session over `source`.
    pub fn spawn(client: DeliveryClient<P>, source: InboxSource) -> DeliveryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DeliveryStatus::offline());

        let mut task = DeliveryTask {
            client,
            rx,
            status: status_tx,
            transport: source.name(),
            connected: false,
        };
        task.publish();

        let join = tokio::spawn(async move {
            let session_id = task.client.session_id().to_string();
            log::info!("Starting {} delivery for session {}", task.transport, session_id);
            match source {
                InboxSource::Poll(poll) => task.run_polling(poll).await,
                InboxSource::Push(push) => task.run_push(push).await,
            }
            log::info!("Delivery for session {} stopped", session_id);
        });

        DeliveryHandle {
            tx,
            status: status_rx,
            join: Some(join),
        }
    }

    async fn run_polling(&mut self, poll: PollSource) {
        let session_id = self.client.session_id().to_string();
        // first check right away so anything queued before startup shows up
        let sleep = time::sleep(Duration::ZERO);
        tokio::pin!(sleep);
        let mut paused = false;

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let now = Instant::now();
                    match self.apply(cmd, now) {
                        Effect::Shutdown => return,
                        Effect::Activity { resumed: true } => {
                            paused = false;
                            sleep.as_mut().reset(now);
                        }
                        Effect::Activity { resumed: false } => {
                            let sooner = now + self.client.state().poll_interval();
                            if !paused && sleep.deadline() > sooner {
                                sleep.as_mut().reset(sooner);
                            }
                        }
                        Effect::None => {}
                    }
                }
                _ = &mut sleep, if !paused => {
                    let Some(result) = self.fetch_while_serving(poll.check(&session_id)).await else {
                        return;
                    };

                    let now = Instant::now();
                    let schedule = match result {
                        Ok(snapshot) => self.client.on_inbox(snapshot, now),
                        Err(e) => {
                            log::warn!("Inbox check for session {} failed: {}", session_id, e);
                            self.client.on_poll_failure(now)
                        }
                    };
                    match schedule {
                        Schedule::After(delay) => sleep.as_mut().reset(now + delay),
                        Schedule::Paused => paused = true,
                    }
                }
            }
            self.publish();
        }
    }

    /// Awaits an inbox fetch while still applying commands. Returns None if
    /// shut down meanwhile; the late result is discarded.
    async fn fetch_while_serving<F, T>(&mut self, fetch: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                result = &mut fetch => return Some(result),
                cmd = self.rx.recv() => {
                    if let Effect::Shutdown = self.apply(cmd, Instant::now()) {
                        return None;
                    }
                    self.publish();
                }
            }
        }
    }

    async fn run_push(&mut self, push: PushSource) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        // also fires when this task is aborted mid-await
        let _stream = AbortOnDrop(push.spawn(self.client.session_id().to_string(), events_tx));

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    if let Effect::Shutdown = self.apply(cmd, Instant::now()) {
                        break;
                    }
                }
                event = events_rx.recv() => match event {
                    Some(PushEvent::Connected) => self.connected = true,
                    Some(PushEvent::Disconnected) => self.connected = false,
                    Some(PushEvent::Entries(entries)) => {
                        self.client.on_new_entries(entries, Instant::now());
                    }
                    None => break,
                },
            }
            self.publish();
        }
    }

    fn apply(&mut self, cmd: Option<Command>, now: Instant) -> Effect {
        match cmd {
            None | Some(Command::Shutdown) => Effect::Shutdown,
            Some(Command::Activity) => Effect::Activity {
                resumed: self.client.mark_activity(now),
            },
            Some(Command::VoiceActive(active)) => {
                let resumed = self.client.set_voice_active(active, now);
                if active {
                    Effect::Activity { resumed }
                } else {
                    Effect::None
                }
            }
            Some(Command::ChatActive(active)) => {
                let resumed = self.client.set_chat_active(active, now);
                if active {
                    Effect::Activity { resumed }
                } else {
                    Effect::None
                }
            }
            Some(Command::Record(message)) => {
                self.client.record(message, now);
                Effect::None
            }
            Some(Command::Clear) => {
                self.client.clear();
                Effect::None
            }
            Some(Command::Context(reply)) => {
                let _ = reply.send(self.client.conversation_context());
                Effect::None
            }
        }
    }

    fn publish(&self) {
        let state = self.client.state();
        let status = DeliveryStatus {
            phase: self.client.phase(),
            transport: self.transport,
            poll_interval_ms: state.poll_interval_ms,
            consecutive_empty_polls: state.consecutive_empty_polls,
            connected: self.connected,
            transcript_len: self.client.transcript().len(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Aborts the wrapped task when dropped; a bare JoinHandle only detaches.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Control surface of a running delivery task.
pub struct DeliveryHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<DeliveryStatus>,
    join: Option<JoinHandle<()>>,
}

impl DeliveryHandle {
    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            log::debug!("Delivery task is gone, command dropped");
        }
    }

    pub fn mark_activity(&self) {
        self.send(Command::Activity);
    }

    pub fn set_voice_active(&self, active: bool) {
        self.send(Command::VoiceActive(active));
    }

    pub fn set_chat_active(&self, active: bool) {
        self.send(Command::ChatActive(active));
    }

    pub fn record(&self, message: ChatMessage) {
        self.send(Command::Record(message));
    }

    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    /// Conversation context rendered from the current transcript.
    pub async fn context(&self) -> Option<ConversationContext> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Context(reply_tx));
        reply_rx.await.ok()
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeliveryStatus> {
        self.status.clone()
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                log::warn!("Delivery task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::poll::InboxFetcher;
    use crate::delivery::sse::{ByteStream, EventStreamOpener};
    use crate::delivery::testing::{tool_message, RecordingPresenter};
    use crate::transcript::TranscriptStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Serves canned inbox snapshots and logs when it was asked.
    struct FakeInbox {
        responses: Mutex<Vec<Result<Vec<ChatMessage>>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl FakeInbox {
        fn new(responses: Vec<Result<Vec<ChatMessage>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InboxFetcher for FakeInbox {
        async fn fetch_inbox(&self, _session_id: &str) -> Result<Vec<ChatMessage>> {
            self.calls.lock().unwrap().push(Instant::now());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                responses.remove(0)
            }
        }
    }

    /// Presenter whose output can be inspected from the test.
    #[derive(Clone, Default)]
    struct SharedPresenter(Arc<Mutex<RecordingPresenter>>);

    impl Presenter for SharedPresenter {
        fn render(&mut self, entry: &ChatMessage) {
            self.0.lock().unwrap().render(entry);
        }
        fn autoscroll(&mut self, force: bool) {
            self.0.lock().unwrap().autoscroll(force);
        }
        fn clear(&mut self) {
            self.0.lock().unwrap().clear();
        }
    }

    impl SharedPresenter {
        fn rendered(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .rendered
                .iter()
                .map(|m| m.content.clone())
                .collect()
        }
    }

    fn spawn_polling(inbox: Arc<FakeInbox>, presenter: SharedPresenter) -> DeliveryHandle {
        let client = DeliveryClient::new(TranscriptStore::in_memory("s1"), presenter, Instant::now());
        DeliveryTask::spawn(client, InboxSource::Poll(PollSource::new(inbox)))
    }

    fn gaps(calls: &[Instant]) -> Vec<u64> {
        calls
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_immediately_then_at_recent_interval() {
        let inbox = FakeInbox::new(vec![Ok(vec![tool_message("hello")])]);
        let presenter = SharedPresenter::default();
        let handle = spawn_polling(inbox.clone(), presenter.clone());

        time::sleep(Duration::from_millis(16_500)).await;
        assert_eq!(gaps(&inbox.calls()), vec![8_000, 8_000]);
        assert_eq!(presenter.rendered(), vec!["hello"]);
        assert_eq!(handle.status().transcript_len, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_when_idle_and_resumes_on_activity() {
        let inbox = FakeInbox::new(Vec::new());
        let handle = spawn_polling(inbox.clone(), SharedPresenter::default());

        // 8s tier for 2 min, then 10s tier, then 15s; pause once past 10 min
        time::sleep(Duration::from_secs(700)).await;
        let status = handle.status();
        assert_eq!(status.phase, DeliveryPhase::Paused);
        let polls_when_paused = inbox.calls().len();

        time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(inbox.calls().len(), polls_when_paused);

        handle.mark_activity();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(inbox.calls().len(), polls_when_paused + 1);
        assert_eq!(handle.status().phase, DeliveryPhase::Active);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_is_rescheduled_not_retried() {
        let inbox = FakeInbox::new(vec![Err(anyhow!("502 Bad Gateway")), Err(anyhow!("timeout"))]);
        let handle = spawn_polling(inbox.clone(), SharedPresenter::default());

        time::sleep(Duration::from_millis(8_100)).await;
        assert_eq!(inbox.calls().len(), 2);
        assert_eq!(handle.status().consecutive_empty_polls, 6);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pulls_a_slow_timer_forward() {
        // one new entry per poll keeps the empty-poll counter at zero
        let snapshots = (1..=100)
            .map(|n| Ok((0..n).rev().map(|k| tool_message(&format!("n{}", k))).collect()))
            .collect();
        let inbox = FakeInbox::new(snapshots);
        let handle = spawn_polling(inbox.clone(), SharedPresenter::default());

        // last poll at 600s switched to the 15s tier: next one due at 615s
        time::sleep(Duration::from_secs(605)).await;
        assert_eq!(handle.status().poll_interval_ms, 15_000);
        let before = inbox.calls().len();

        handle.mark_activity();
        time::sleep(Duration::from_millis(8_050)).await;
        assert_eq!(inbox.calls().len(), before + 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_and_context_go_through_the_task() {
        let inbox = FakeInbox::new(Vec::new());
        let presenter = SharedPresenter::default();
        let handle = spawn_polling(inbox, presenter.clone());

        for i in 0..31 {
            handle.record(ChatMessage::user(format!("m{}", i)));
        }
        let context = handle.context().await.unwrap();
        let lines: Vec<&str> = context.chat_history.lines().collect();
        assert_eq!(lines.len(), 30);
        assert_eq!(lines[0], "User: m1");
        assert_eq!(lines[29], "User: m30");

        handle.clear();
        let context = handle.context().await.unwrap();
        assert_eq!(context.chat_history, "Keine vorherigen Nachrichten");
        assert!(presenter.rendered().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let inbox = FakeInbox::new(Vec::new());
        let handle = spawn_polling(inbox.clone(), SharedPresenter::default());
        time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        let polls = inbox.calls().len();
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(inbox.calls().len(), polls);
    }

    struct OneShotStream;

    #[async_trait]
    impl EventStreamOpener for OneShotStream {
        async fn open(&self, _session_id: &str) -> Result<ByteStream> {
            let body = concat!(
                "data: {\"role\":\"assistant\",\"content\":\"Link gesendet\",\"source\":\"vapi-tool\"}\n\n",
                ": keep-alive\n\n",
                "data: {\"role\":\"assistant\",\"content\":\"link  gesendet\"}\n\n",
            );
            Ok(stream::iter(vec![Ok(body.as_bytes().to_vec())])
                .chain(stream::pending())
                .boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_transport_feeds_same_ingestion() {
        let presenter = SharedPresenter::default();
        let client = DeliveryClient::new(
            TranscriptStore::in_memory("s1"),
            presenter.clone(),
            Instant::now(),
        );
        let handle = DeliveryTask::spawn(
            client,
            InboxSource::Push(PushSource::new(Arc::new(OneShotStream))),
        );

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(presenter.rendered(), vec!["Link gesendet"]);
        let status = handle.status();
        assert!(status.connected);
        assert_eq!(status.transport, "push");

        handle.shutdown().await;
    }

    /// Flips its flag when the stream holding it is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// A connection that only ever sends keep-alives.
    struct IdleStream {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EventStreamOpener for IdleStream {
        async fn open(&self, _session_id: &str) -> Result<ByteStream> {
            let flag = DropFlag(self.dropped.clone());
            Ok(stream::iter(vec![Ok(b": keep-alive\n\n".to_vec())])
                .chain(stream::pending())
                .map(move |chunk| {
                    let _ = &flag;
                    chunk
                })
                .boxed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_closes_idle_push_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let client = DeliveryClient::new(
            TranscriptStore::in_memory("s1"),
            SharedPresenter::default(),
            Instant::now(),
        );
        let handle = DeliveryTask::spawn(
            client,
            InboxSource::Push(PushSource::new(Arc::new(IdleStream {
                dropped: dropped.clone(),
            }))),
        );

        time::sleep(Duration::from_millis(50)).await;
        assert!(handle.status().connected);
        assert!(!dropped.load(Ordering::SeqCst));

        drop(handle);
        time::sleep(Duration::from_secs(3_600)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
