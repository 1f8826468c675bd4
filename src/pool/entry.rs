// ABOUTME: Pool entries and their Free -> Active -> {Free, Broken} state machine
//
// An entry is one transport client sitting in a pool slot. Broken entries are
// only reachable from Active and leave that state only by being replaced.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

// === Client ID ===

/// Identity of one constructed transport client
///
/// Replacing a broken slot always yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Entry State ===

/// Lifecycle state of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Available for the next request
    Free,
    /// A request is in flight on this client
    Active,
    /// Last request failed; must be replaced before reuse
    Broken,
}

impl EntryState {
    /// Whether moving to `next` is a legal transition
    ///
    /// `Broken -> Free` is deliberately absent: broken slots come back only as
    /// freshly constructed entries.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Free, Self::Active) | (Self::Active, Self::Free | Self::Broken)
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Active => f.write_str("active"),
            Self::Broken => f.write_str("broken"),
        }
    }
}

// === Pool Entry ===

/// One transport client in a pool slot
///
/// The client is shared through an `Arc`: a request holding it keeps the old
/// client alive even after its slot has been replaced, and the client is
/// dropped only when the last holder lets go.
pub struct PoolEntry<C> {
    id: ClientId,
    client: Arc<C>,
    state: EntryState,
    requests_served: u64,
}

impl<C> PoolEntry<C> {
    /// Wrap a freshly constructed client
    pub fn new(client: C) -> Self {
        Self {
            id: ClientId::new(),
            client: Arc::new(client),
            state: EntryState::Free,
            requests_served: 0,
        }
    }

    /// Client identity
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Current state
    pub const fn state(&self) -> EntryState {
        self.state
    }

    /// Shared handle to the transport client
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Number of requests that have been dispatched on this client
    pub const fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// True when the entry can be handed out
    pub fn is_free(&self) -> bool {
        self.state == EntryState::Free
    }

    /// Free -> Active; returns false (and changes nothing) from any other state
    pub(crate) fn activate(&mut self) -> bool {
        if !self.state.can_transition_to(EntryState::Active) {
            return false;
        }
        self.state = EntryState::Active;
        self.requests_served += 1;
        true
    }

    /// Active -> Free or Broken; returns false (and changes nothing) if not Active
    pub(crate) fn finish(&mut self, saw_error: bool) -> bool {
        let next = if saw_error {
            EntryState::Broken
        } else {
            EntryState::Free
        };
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }
}

impl<C> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("requests_served", &self.requests_served)
            .finish_non_exhaustive()
    }
}
