//! Adaptive delivery of out-of-band assistant messages.
//!
//! [`DeliveryClient`] is the synchronous state machine: it owns the
//! transcript and presenter and is driven with explicit instants, so it can
//! be exercised without a runtime. [`task::DeliveryTask`] puts it on a tokio
//! task together with exactly one [`InboxSource`].

pub mod dedup;
pub mod poll;
pub mod policy;
pub mod sse;
pub mod task;

use tokio::time::Instant;

use crate::presenter::Presenter;
use crate::state::{ChatMessage, ChatRole};
use crate::transcript::{ConversationContext, TranscriptStore};

pub use dedup::DedupWindow;
pub use poll::{InboxFetcher, PollSource};
pub use policy::{DeliveryState, Schedule};
pub use sse::{EventStreamOpener, PushSource};
pub use task::{DeliveryHandle, DeliveryStatus, DeliveryTask};

/// How inbox entries reach the client. Chosen once per session.
#[derive(Clone)]
pub enum InboxSource {
    Poll(PollSource),
    Push(PushSource),
}

impl InboxSource {
    pub fn name(&self) -> &'static str {
        match self {
            InboxSource::Poll(_) => "poll",
            InboxSource::Push(_) => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    Uninitialized,
    Active,
    Paused,
}

impl DeliveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryPhase::Uninitialized => "offline",
            DeliveryPhase::Active => "active",
            DeliveryPhase::Paused => "paused",
        }
    }
}

pub struct DeliveryClient<P: Presenter> {
    state: DeliveryState,
    dedup: DedupWindow,
    transcript: TranscriptStore,
    presenter: P,
}

impl<P: Presenter> DeliveryClient<P> {
    /// Creates an active client and replays the loaded transcript into the
    /// presenter.
    pub fn new(transcript: TranscriptStore, mut presenter: P, now: Instant) -> Self {
        for entry in transcript.messages() {
            presenter.render(entry);
        }
        if !transcript.is_empty() {
            presenter.autoscroll(true);
        }

        Self {
            state: DeliveryState::new(transcript.session_id(), now),
            dedup: DedupWindow::default(),
            transcript,
            presenter,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    pub fn phase(&self) -> DeliveryPhase {
        if self.state.is_paused {
            DeliveryPhase::Paused
        } else {
            DeliveryPhase::Active
        }
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn conversation_context(&self) -> ConversationContext {
        self.transcript.conversation_context()
    }

    /// Returns true if the client was paused and has resumed.
    pub fn mark_activity(&mut self, now: Instant) -> bool {
        let resumed = self.state.mark_activity(now);
        if resumed {
            log::info!("Delivery for session {} resumed", self.state.session_id);
        }
        resumed
    }

    pub fn set_voice_active(&mut self, active: bool, now: Instant) -> bool {
        let resumed = self.state.set_voice_active(active, now);
        if resumed {
            log::info!("Delivery for session {} resumed by voice call", self.state.session_id);
        }
        resumed
    }

    pub fn set_chat_active(&mut self, active: bool, now: Instant) -> bool {
        self.state.set_chat_active(active, now)
    }

    /// Ingests inbound entries, oldest first. Returns how many were new.
    pub fn on_new_entries(&mut self, entries: Vec<ChatMessage>, now: Instant) -> usize {
        let mut appended = 0;
        for entry in entries {
            if self.already_in_transcript(&entry) || self.dedup.is_duplicate(&entry, now) {
                log::debug!("Dropping duplicate {:?} message", entry.role);
                continue;
            }
            self.transcript.append(entry.clone());
            self.presenter.render(&entry);
            appended += 1;
        }
        if appended > 0 {
            self.presenter.autoscroll(false);
        }
        appended
    }

    /// Handles a successful poll: `snapshot` is the whole inbox, newest first.
    pub fn on_inbox(&mut self, snapshot: Vec<ChatMessage>, now: Instant) -> Schedule {
        let (fresh, mark) = poll::slice_new_entries(snapshot, self.state.last_delivered_count);
        self.state.last_delivered_count = mark;
        let new_entries = fresh.len();
        if new_entries > 0 {
            log::info!("{} new inbox entries for session {}", new_entries, self.state.session_id);
        }

        self.on_new_entries(fresh, now);
        self.state.record_poll(new_entries);
        self.reschedule(now)
    }

    pub fn on_poll_failure(&mut self, now: Instant) -> Schedule {
        self.state.record_failure();
        self.reschedule(now)
    }

    /// Records a locally originated turn (typed chat, assistant reply, voice
    /// transcript). Never deduplicated.
    pub fn record(&mut self, message: ChatMessage, now: Instant) {
        self.dedup.remember(&message, now);
        let force = message.role == ChatRole::User;
        self.transcript.append(message.clone());
        self.presenter.render(&message);
        self.presenter.autoscroll(force);
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
        self.presenter.clear();
    }

    fn reschedule(&mut self, now: Instant) -> Schedule {
        let schedule = self.state.next_schedule(now);
        match schedule {
            Schedule::Paused => log::info!(
                "Delivery for session {} paused after {} empty polls",
                self.state.session_id,
                self.state.consecutive_empty_polls
            ),
            Schedule::After(interval) => log::debug!("Next inbox check in {:?}", interval),
        }
        schedule
    }

    fn already_in_transcript(&self, entry: &ChatMessage) -> bool {
        self.transcript.messages().iter().any(|m| m == entry)
    }
}
