//! The `NetworkManager` (§4.5, §6 "Network manager"): a single authority on
//! connectivity whose changes fan out to every paused query instance.
//!
//! Exposed two ways: as a reactive signal (`is_online()`), for anything that
//! wants to read current status inside a derivation, and as an explicit
//! listener list, for the Query Engine's retry/pause machinery, which needs
//! to react to a transition synchronously rather than wait for the next
//! reactive tick.

use reactive_graph::owner::StoredValue;
use reactive_graph::prelude::*;
use reactive_graph::signal::RwSignal;
use std::rc::Rc;

type Listener = Rc<dyn Fn(bool)>;

/// `NetworkMode` (§4.5): how a query instance reacts to `NetworkManager`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Pause when offline; refetch on reconnect if stale (gated by
    /// `refreshStaleOnReconnect`, default true).
    #[default]
    Online,
    /// Never pause.
    Always,
    /// Pause only when offline *and* no cached value exists yet.
    OfflineFirst,
}

#[derive(Clone)]
pub struct NetworkManager {
    is_online: RwSignal<bool>,
    listeners: StoredValue<Vec<Listener>>,
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager {
    pub fn new() -> Self {
        Self {
            is_online: RwSignal::new(true),
            listeners: StoredValue::new(Vec::new()),
        }
    }

    /// Reactive read of current connectivity; registers the caller as a
    /// dependency.
    pub fn is_online(&self) -> bool {
        self.is_online.get()
    }

    /// Non-reactive read, for code that must not create a dependency (e.g.
    /// deciding whether to launch a retry from inside a timer callback).
    pub fn is_online_untracked(&self) -> bool {
        self.is_online.get_untracked()
    }

    /// `setNetworkStatus(bool)`. A no-op if the status did not change —
    /// listeners only fire on an actual transition.
    pub fn set_network_status(&self, online: bool) {
        let changed = self.is_online.try_update(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed == Some(true) {
            let fns = self.listeners.get_value();
            for listener in fns {
                listener(online);
            }
        }
    }

    /// Registers a transition listener. Returns an unsubscribe closure.
    pub fn on_transition(&self, listener: impl Fn(bool) + 'static) -> impl FnOnce() {
        let listener: Listener = Rc::new(listener);
        let weak_marker = Rc::as_ptr(&listener);
        self.listeners.update_value(|v| v.push(listener));
        let listeners = self.listeners;
        move || {
            listeners.update_value(|v| v.retain(|l| Rc::as_ptr(l) != weak_marker));
        }
    }
}

/// Gates whether a query instance should pause given its `mode`, current
/// connectivity, and whether it already holds a cached value.
pub fn should_pause(mode: NetworkMode, is_online: bool, has_cached_value: bool) -> bool {
    match mode {
        NetworkMode::Always => false,
        NetworkMode::Online => !is_online,
        NetworkMode::OfflineFirst => !is_online && !has_cached_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_mode_pauses_only_when_offline() {
        assert!(!should_pause(NetworkMode::Online, true, false));
        assert!(should_pause(NetworkMode::Online, false, false));
        assert!(should_pause(NetworkMode::Online, false, true));
    }

    #[test]
    fn offline_first_pauses_only_without_cached_value() {
        assert!(!should_pause(NetworkMode::OfflineFirst, false, true));
        assert!(should_pause(NetworkMode::OfflineFirst, false, false));
    }

    #[test]
    fn always_never_pauses() {
        assert!(!should_pause(NetworkMode::Always, false, false));
    }

    #[test]
    fn set_network_status_only_notifies_on_change() {
        let manager = NetworkManager::new();
        let calls = Rc::new(std::cell::RefCell::new(Vec::new()));
        let calls_clone = calls.clone();
        let _unsub = manager.on_transition(move |online| calls_clone.borrow_mut().push(online));

        manager.set_network_status(true); // already true, no-op
        assert!(calls.borrow().is_empty());

        manager.set_network_status(false);
        manager.set_network_status(false); // repeat, no-op
        manager.set_network_status(true);
        assert_eq!(*calls.borrow(), vec![false, true]);
    }
}
