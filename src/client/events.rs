//! Event listener registry and dispatch.
//!
//! Completed event payloads carry the application event type in byte 0.
//! Listeners registered for that type run first, then wildcard listeners.
//! A failing or panicking listener is logged and does not affect the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;

/// Result type for event listeners.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A registered event callback.
pub type EventListener = Arc<dyn Fn(&AppEvent) -> ListenerResult + Send + Sync>;

/// An application event received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEvent {
    /// Application event type (byte 0 of the payload).
    pub app_type: u8,
    /// Remaining payload bytes.
    pub data: Vec<u8>,
}

impl AppEvent {
    /// Split a completed event payload. Returns `None` for an empty payload.
    pub fn from_payload(mut payload: Vec<u8>) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let app_type = payload.remove(0);
        Some(Self {
            app_type,
            data: payload,
        })
    }
}

/// Which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Only events of this application type.
    Type(u8),
    /// Every event.
    Any,
}

impl From<u8> for EventFilter {
    fn from(app_type: u8) -> Self {
        Self::Type(app_type)
    }
}

/// Handle returned by listener registration, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct EventDispatcher {
    typed: HashMap<u8, Vec<(ListenerId, EventListener)>>,
    wildcard: Vec<(ListenerId, EventListener)>,
    next_id: u64,
}

impl EventDispatcher {
    pub fn add(&mut self, filter: EventFilter, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        match filter {
            EventFilter::Type(app_type) => self
                .typed
                .entry(app_type)
                .or_default()
                .push((id, listener)),
            EventFilter::Any => self.wildcard.push((id, listener)),
        }
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        if let Some(pos) = self.wildcard.iter().position(|(lid, _)| *lid == id) {
            self.wildcard.remove(pos);
            return true;
        }
        let found = self.typed.iter_mut().find_map(|(app_type, listeners)| {
            let pos = listeners.iter().position(|(lid, _)| *lid == id)?;
            listeners.remove(pos);
            Some((*app_type, listeners.is_empty()))
        });
        match found {
            Some((app_type, now_empty)) => {
                if now_empty {
                    self.typed.remove(&app_type);
                }
                true
            }
            None => false,
        }
    }

    /// Listeners for an event type in call order: typed, then wildcard.
    ///
    /// Returned as a snapshot so callbacks run without the registry locked.
    pub fn listeners_for(&self, app_type: u8) -> Vec<EventListener> {
        self.typed
            .get(&app_type)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.wildcard.len() + self.typed.values().map(Vec::len).sum::<usize>()
    }
}

/// Call each listener with the event, isolating failures.
///
/// Returns the number of listeners that failed or panicked.
pub(crate) fn deliver(event: &AppEvent, listeners: &[EventListener]) -> usize {
    let mut failures = 0;
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                error!("Event listener failed for type {}: {}", event.app_type, e);
            }
            Err(panic_info) => {
                failures += 1;
                error!(
                    "Event listener panicked for type {}: {}",
                    event.app_type,
                    extract_panic_message(&panic_info)
                );
            }
        }
    }
    failures
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventListener {
        let log = log.clone();
        Arc::new(move |event: &AppEvent| -> ListenerResult {
            log.lock().unwrap().push(format!("{}:{}", tag, event.app_type));
            Ok(())
        })
    }

    #[test]
    fn test_from_payload() {
        assert_eq!(AppEvent::from_payload(vec![]), None);
        assert_eq!(
            AppEvent::from_payload(vec![0x01, b'h', b'i']),
            Some(AppEvent {
                app_type: 0x01,
                data: b"hi".to_vec()
            })
        );
        assert_eq!(
            AppEvent::from_payload(vec![0x02]),
            Some(AppEvent {
                app_type: 0x02,
                data: vec![]
            })
        );
    }

    #[test]
    fn test_typed_then_wildcard_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::default();
        dispatcher.add(EventFilter::Any, recorder(&log, "any"));
        dispatcher.add(1.into(), recorder(&log, "log"));
        dispatcher.add(2.into(), recorder(&log, "port"));

        let event = AppEvent::from_payload(vec![1, 0]).unwrap();
        deliver(&event, &dispatcher.listeners_for(1));

        assert_eq!(*log.lock().unwrap(), vec!["log:1", "any:1"]);
    }

    #[test]
    fn test_remove_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::default();
        let typed = dispatcher.add(EventFilter::Type(3), recorder(&log, "typed"));
        let any = dispatcher.add(EventFilter::Any, recorder(&log, "any"));
        assert_eq!(dispatcher.len(), 2);

        assert!(dispatcher.remove(typed));
        assert!(!dispatcher.remove(typed));
        assert_eq!(dispatcher.listeners_for(3).len(), 1);

        assert!(dispatcher.remove(any));
        assert!(dispatcher.listeners_for(3).is_empty());
        assert_eq!(dispatcher.len(), 0);
    }

    #[test]
    fn test_failing_listeners_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::default();
        dispatcher.add(
            EventFilter::Type(4),
            Arc::new(|_: &AppEvent| -> ListenerResult { Err("bad payload".into()) }),
        );
        dispatcher.add(
            EventFilter::Type(4),
            Arc::new(|_: &AppEvent| -> ListenerResult { panic!("listener bug") }),
        );
        dispatcher.add(EventFilter::Any, recorder(&log, "after"));

        let event = AppEvent::from_payload(vec![4]).unwrap();
        let failures = deliver(&event, &dispatcher.listeners_for(4));

        assert_eq!(failures, 2);
        assert_eq!(*log.lock().unwrap(), vec!["after:4"]);
    }
}
