use shared::domain::{DeliveryStatus, Message, MessageId, UserId};
use uuid::Uuid;

/// Identifies one history load. Only the newest ticket may populate the
/// thread; results for older tickets are stale and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Appended,
    /// Shown now and merged with history once the in-flight load resolves.
    Buffered,
    Duplicate,
    /// The sender is not the open counterpart.
    NotOpen,
}

/// Messages exchanged with the open counterpart.
#[derive(Debug, Default)]
pub struct MessageThread {
    counterpart: Option<UserId>,
    messages: Vec<Message>,
    loading: Option<LoadTicket>,
    last_ticket: u64,
}

impl MessageThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counterpart(&self) -> Option<&UserId> {
        self.counterpart.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn current(&self) -> &[Message] {
        &self.messages
    }

    /// Switches to `counterpart`, dropping every message of the previous
    /// thread right away.
    pub fn begin_load(&mut self, counterpart: UserId) -> LoadTicket {
        self.last_ticket += 1;
        let ticket = LoadTicket(self.last_ticket);
        self.counterpart = Some(counterpart);
        self.messages.clear();
        self.loading = Some(ticket);
        ticket
    }

    pub fn is_current(&self, ticket: LoadTicket) -> bool {
        self.loading == Some(ticket)
    }

    /// Replaces the thread with `history`, then re-adds anything that
    /// arrived while the load was in flight, skipping copies that share a
    /// server or correlation id. Returns `false` for a stale ticket, leaving
    /// the thread untouched.
    pub fn complete_load(&mut self, ticket: LoadTicket, history: Vec<Message>) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.loading = None;

        let arrived_during_load = std::mem::take(&mut self.messages);
        self.messages.reserve(history.len() + arrived_during_load.len());
        for message in history {
            self.insert(message);
        }
        for message in arrived_during_load {
            self.insert(message);
        }
        true
    }

    /// Ends a failed load, keeping whatever arrived live in the meantime.
    pub fn fail_load(&mut self, ticket: LoadTicket) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        self.loading = None;
        true
    }

    pub fn accept_inbound(&mut self, message: Message) -> InboundOutcome {
        if self.counterpart.as_ref() != Some(&message.sender_id) {
            return InboundOutcome::NotOpen;
        }
        if !self.insert(message) {
            return InboundOutcome::Duplicate;
        }
        if self.is_loading() {
            InboundOutcome::Buffered
        } else {
            InboundOutcome::Appended
        }
    }

    /// Appends a locally authored message ahead of any acknowledgement.
    pub fn push_local(&mut self, message: Message) -> bool {
        if self.counterpart.as_ref() != Some(&message.receiver_id) {
            return false;
        }
        self.insert(message)
    }

    pub fn mark_delivery(&mut self, correlation_id: Uuid, status: DeliveryStatus) -> bool {
        match self.find_local_mut(correlation_id) {
            Some(message) => {
                message.delivery = status;
                true
            }
            None => false,
        }
    }

    /// Marks a local message delivered and adopts the server id when the
    /// hub returned one. A later copy carrying that id is then a duplicate.
    pub fn confirm_local(&mut self, correlation_id: Uuid, message_id: Option<MessageId>) -> bool {
        let already_listed = message_id.as_ref().is_some_and(|id| {
            self.messages
                .iter()
                .any(|existing| existing.message_id.as_ref() == Some(id))
        });
        match self.find_local_mut(correlation_id) {
            Some(message) => {
                message.delivery = DeliveryStatus::Delivered;
                if !already_listed && message_id.is_some() {
                    message.message_id = message_id;
                }
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.counterpart = None;
        self.messages.clear();
        self.loading = None;
    }

    fn find_local_mut(&mut self, correlation_id: Uuid) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.correlation_id == Some(correlation_id))
    }

    fn contains(&self, candidate: &Message) -> bool {
        self.messages.iter().any(|existing| {
            (candidate.message_id.is_some() && existing.message_id == candidate.message_id)
                || (candidate.correlation_id.is_some()
                    && existing.correlation_id == candidate.correlation_id)
        })
    }

    /// Appends, except that a server-confirmed message older than the tail
    /// is slotted by `(sent_at, message_id)`.
    fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message) {
            return false;
        }

        let mut index = self.messages.len();
        if message.is_confirmed() {
            let key = (message.sent_at, message.message_id.as_ref());
            while index > 0 {
                let previous = &self.messages[index - 1];
                if (previous.sent_at, previous.message_id.as_ref()) <= key {
                    break;
                }
                index -= 1;
            }
        }
        self.messages.insert(index, message);
        true
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
