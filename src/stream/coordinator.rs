//! Several stream connections presented as one.

use crate::subscriptions::{ListenerSet, Subscription};
use crate::types::{ChangeEvent, ConnectionState, MemberEvent};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::connection::StreamConnection;

type MemberHandler = Arc<dyn Fn(&MemberEvent) + Send + Sync>;

/// Fold member states into the coordinator's state.
///
/// Connected only when every member is. A member that gave up while another
/// is still trying reads as Error rather than Disconnected.
pub fn aggregate_state(enabled: bool, members: &[ConnectionState]) -> ConnectionState {
    use ConnectionState::*;

    if !enabled || members.is_empty() {
        return Disconnected;
    }
    if members.iter().all(|s| *s == Connected) {
        return Connected;
    }
    if members.contains(&Error) {
        return Error;
    }
    if members.contains(&Disconnected) {
        return if members.contains(&Connecting) {
            Error
        } else {
            Disconnected
        };
    }
    Connecting
}

struct Aggregate {
    enabled: bool,
    /// Set while members are being started together; member updates are
    /// recorded but not folded until it clears.
    settling: bool,
    members: Vec<ConnectionState>,
    state: ConnectionState,
}

impl Aggregate {
    /// Recompute and return the new state if it changed.
    fn refold(&mut self) -> Option<ConnectionState> {
        if self.settling {
            return None;
        }
        let next = aggregate_state(self.enabled, &self.members);
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

struct Shared {
    aggregate: Mutex<Aggregate>,
    status: ListenerSet<ConnectionState>,
    handler: RwLock<Option<MemberHandler>>,
}

impl Shared {
    fn member_changed(&self, index: usize, member: &str, state: ConnectionState) {
        let changed = {
            let mut aggregate = self.aggregate.lock();
            match aggregate.members.get_mut(index) {
                Some(slot) => *slot = state,
                None => return,
            }
            aggregate.refold()
        };

        debug!(member, state = %state, "member state changed");
        if let Some(next) = changed {
            self.status.emit(&next);
        }
    }

    fn forward(&self, member: &str, event: &ChangeEvent) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            let tagged = MemberEvent {
                member: member.to_string(),
                event: event.clone(),
            };
            if catch_unwind(AssertUnwindSafe(|| handler(&tagged))).is_err() {
                warn!(member, "coordinator event handler panicked");
            }
        }
    }

    /// Run `start` with folding suspended, then fold once.
    fn settle(&self, enabled: bool, start: impl FnOnce()) {
        {
            let mut aggregate = self.aggregate.lock();
            aggregate.enabled = enabled;
            aggregate.settling = true;
        }
        start();
        let changed = {
            let mut aggregate = self.aggregate.lock();
            aggregate.settling = false;
            aggregate.refold()
        };
        if let Some(next) = changed {
            self.status.emit(&next);
        }
    }
}

/// Drives a fixed set of [`StreamConnection`]s as one logical feed.
///
/// Members are named by their connection id. Events arrive tagged with the
/// member that produced them; there is no ordering across members.
pub struct DualChannelCoordinator {
    members: Vec<StreamConnection>,
    shared: Arc<Shared>,
    _watchers: Vec<Subscription>,
}

impl DualChannelCoordinator {
    pub fn new(members: impl IntoIterator<Item = StreamConnection>) -> Self {
        let members: Vec<StreamConnection> = members.into_iter().collect();
        let shared = Arc::new(Shared {
            aggregate: Mutex::new(Aggregate {
                enabled: false,
                settling: false,
                members: members.iter().map(StreamConnection::state).collect(),
                state: ConnectionState::Disconnected,
            }),
            status: ListenerSet::new(),
            handler: RwLock::new(None),
        });

        let mut watchers = Vec::with_capacity(members.len());
        for (index, connection) in members.iter().enumerate() {
            let member = connection.id().to_string();

            let weak: Weak<Shared> = Arc::downgrade(&shared);
            let name = member.clone();
            watchers.push(connection.on_status_change(move |state| {
                if let Some(shared) = weak.upgrade() {
                    shared.member_changed(index, &name, *state);
                }
            }));

            let weak: Weak<Shared> = Arc::downgrade(&shared);
            connection.on_event(move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.forward(&member, event);
                }
            });
        }

        Self {
            members,
            shared,
            _watchers: watchers,
        }
    }

    /// Coordinator over exactly two connections.
    pub fn pair(first: StreamConnection, second: StreamConnection) -> Self {
        Self::new([first, second])
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.aggregate.lock().state
    }

    /// Member ids with their current states, in construction order.
    pub fn member_states(&self) -> Vec<(String, ConnectionState)> {
        self.members
            .iter()
            .map(|m| (m.id().to_string(), m.state()))
            .collect()
    }

    pub fn member(&self, id: &str) -> Option<&StreamConnection> {
        self.members.iter().find(|m| m.id() == id)
    }

    pub fn enable(&self) {
        self.shared.settle(true, || {
            for member in &self.members {
                member.enable();
            }
        });
    }

    /// Disable every member. Reports Disconnected immediately.
    pub fn disable(&self) {
        let changed = {
            let mut aggregate = self.shared.aggregate.lock();
            aggregate.enabled = false;
            aggregate.refold()
        };
        if let Some(next) = changed {
            self.shared.status.emit(&next);
        }
        for member in &self.members {
            member.disable();
        }
    }

    /// Restart every member with a fresh attempt budget.
    pub fn reconnect(&self) {
        self.shared.settle(true, || {
            for member in &self.members {
                member.reconnect();
            }
        });
    }

    pub fn on_status_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.status.subscribe(listener)
    }

    /// Set the event handler, replacing any previous one.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&MemberEvent) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }
}

impl std::fmt::Debug for DualChannelCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualChannelCoordinator")
            .field("state", &self.state())
            .field("members", &self.member_states())
            .finish()
    }
}
