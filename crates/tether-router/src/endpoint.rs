use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tether_proto::{DisconnectReason, InterfaceId, Message};

/// The consumer attached to one endpoint: a proxy's error sink or a stub's dispatcher.
pub trait EndpointClient {
    /// Returns false if the message is invalid; the router then treats the pipe as corrupt.
    fn handle_incoming_message(&self, message: &Message) -> bool;

    /// The peer side of this endpoint is gone. Always called from a posted task.
    fn notify_error(&self, reason: Option<DisconnectReason>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointStateUpdate {
    EndpointClosed,
    PeerEndpointClosed,
}

pub(crate) struct InterfaceEndpoint {
    pub(crate) id: InterfaceId,
    pub(crate) closed: bool,
    pub(crate) peer_closed: bool,
    pub(crate) handle_created: bool,
    pub(crate) disconnect_reason: Option<DisconnectReason>,
    pub(crate) client: Option<Rc<dyn EndpointClient>>,
    /// Messages that arrived before a client was attached, oldest first.
    pub(crate) pending: VecDeque<Message>,
}

impl InterfaceEndpoint {
    fn new(id: InterfaceId) -> Self {
        Self {
            id,
            closed: false,
            peer_closed: false,
            handle_created: false,
            disconnect_reason: None,
            client: None,
            pending: VecDeque::new(),
        }
    }

    fn state(&self) -> EndpointState {
        EndpointState {
            id: self.id,
            closed: self.closed,
            peer_closed: self.peer_closed,
            handle_created: self.handle_created,
            has_client: self.client.is_some(),
            disconnect_reason: self.disconnect_reason.clone(),
            pending_messages: self.pending.len(),
        }
    }
}

/// A snapshot of one endpoint record, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub id: InterfaceId,
    pub closed: bool,
    pub peer_closed: bool,
    pub handle_created: bool,
    pub has_client: bool,
    pub disconnect_reason: Option<DisconnectReason>,
    pub pending_messages: usize,
}

/// Endpoint records keyed by interface id.
///
/// A record is removed exactly when both `closed` and `peer_closed` are set, and its id is then
/// retired: nothing recreates a record for it.
#[derive(Default)]
pub(crate) struct EndpointTable {
    endpoints: BTreeMap<InterfaceId, InterfaceEndpoint>,
    retired: RetiredIds,
}

/// Torn-down ids, stored as disjoint inclusive ranges keyed by their start.
///
/// Ids are allocated sequentially, so retirements coalesce and the set stays small however many
/// endpoints come and go.
#[derive(Debug, Default)]
pub(crate) struct RetiredIds {
    ranges: BTreeMap<InterfaceId, InterfaceId>,
}

impl RetiredIds {
    pub(crate) fn contains(&self, id: InterfaceId) -> bool {
        self.ranges
            .range(..=id)
            .next_back()
            .is_some_and(|(_, &end)| id <= end)
    }

    pub(crate) fn insert(&mut self, id: InterfaceId) {
        if self.contains(id) {
            return;
        }
        let mut start = id;
        let mut end = id;
        if let Some((&lo, &lo_end)) = self.ranges.range(..id).next_back() {
            if lo_end.checked_add(1) == Some(id) {
                start = lo;
            }
        }
        if let Some(next) = id.checked_add(1) {
            if let Some(next_end) = self.ranges.remove(&next) {
                end = next_end;
            }
        }
        self.ranges.insert(start, end);
    }

    #[cfg(test)]
    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

impl EndpointTable {
    pub(crate) fn get(&self, id: InterfaceId) -> Option<&InterfaceEndpoint> {
        self.endpoints.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InterfaceId) -> Option<&mut InterfaceEndpoint> {
        self.endpoints.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: InterfaceId) -> bool {
        self.endpoints.contains_key(&id)
    }

    pub(crate) fn is_retired(&self, id: InterfaceId) -> bool {
        self.retired.contains(id)
    }

    /// Returns the record for `id`, creating it if needed. `None` if `id` is retired.
    pub(crate) fn find_or_insert(&mut self, id: InterfaceId) -> Option<&mut InterfaceEndpoint> {
        if self.retired.contains(id) {
            return None;
        }
        Some(
            self.endpoints
                .entry(id)
                .or_insert_with(|| InterfaceEndpoint::new(id)),
        )
    }

    pub(crate) fn ids(&self) -> Vec<InterfaceId> {
        self.endpoints.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn state(&self, id: InterfaceId) -> Option<EndpointState> {
        self.endpoints.get(&id).map(InterfaceEndpoint::state)
    }

    /// Sets one of the two monotonic flags on `id` and removes the record if both are now set.
    ///
    /// Missing ids are ignored. The removed record is returned so the caller can drop it outside
    /// any outstanding borrow.
    pub(crate) fn update_state_may_remove(
        &mut self,
        id: InterfaceId,
        update: EndpointStateUpdate,
    ) -> Option<InterfaceEndpoint> {
        let endpoint = self.endpoints.get_mut(&id)?;
        match update {
            EndpointStateUpdate::EndpointClosed => endpoint.closed = true,
            EndpointStateUpdate::PeerEndpointClosed => endpoint.peer_closed = true,
        }
        if !(endpoint.closed && endpoint.peer_closed) {
            return None;
        }
        self.retired.insert(id);
        self.endpoints.remove(&id)
    }
}
