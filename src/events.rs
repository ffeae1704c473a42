//! Tilter position events and their registered callbacks.
//!
//! Each event keeps an ordered list of registrations. A registration counts
//! occurrences and fires on every `every_nth` one, either immediately or
//! after a delay. Delayed calls run on their own thread, but the dispatcher
//! waits for them, so the telemetry reader does not continue until the
//! callback has finished.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;

use crate::errors::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TilterEvent {
    OnPosDown,
    OnPosUp,
    OnNegDown,
    OnNegUp,
    OnPosWait,
    OnNegWait,
}

impl TilterEvent {
    pub const ALL: [TilterEvent; 6] = [
        TilterEvent::OnPosDown,
        TilterEvent::OnPosUp,
        TilterEvent::OnNegDown,
        TilterEvent::OnNegUp,
        TilterEvent::OnPosWait,
        TilterEvent::OnNegWait,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TilterEvent::OnPosDown => "onPosDown",
            TilterEvent::OnPosUp => "onPosUp",
            TilterEvent::OnNegDown => "onNegDown",
            TilterEvent::OnNegUp => "onNegUp",
            TilterEvent::OnPosWait => "onPosWait",
            TilterEvent::OnNegWait => "onNegWait",
        }
    }
}

impl fmt::Display for TilterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TilterEvent {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TilterEvent::ALL
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DriverError::InvalidValue(format!("unknown tilter event '{s}'")))
    }
}

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Returned by [`EventRegistry::register`] to remove the handler later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    callback: EventCallback,
    every_nth: u32,
    fire_count: u32,
    delay: Duration,
}

/// A callback whose counter reached `every_nth`, ready to run.
pub struct DueCall {
    pub event: TilterEvent,
    pub id: HandlerId,
    callback: EventCallback,
    delay: Duration,
}

impl DueCall {
    /// Run now, or after the delay on a helper thread that is joined before returning.
    pub fn run(self) {
        if self.delay.is_zero() {
            (self.callback)();
            return;
        }
        let DueCall {
            event,
            callback,
            delay,
            ..
        } = self;
        debug!("{event}: running handler after {delay:?}");
        let worker = thread::spawn(move || {
            thread::sleep(delay);
            callback();
        });
        if worker.join().is_err() {
            error!("{event}: delayed handler panicked");
        }
    }
}

#[derive(Default)]
pub struct EventRegistry {
    handlers: BTreeMap<TilterEvent, Vec<Registration>>,
    next_id: u64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler fired on every `every_nth` occurrence (0 is treated as 1).
    pub fn register(
        &mut self,
        event: TilterEvent,
        callback: EventCallback,
        every_nth: u32,
        delay: Duration,
    ) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers.entry(event).or_default().push(Registration {
            id,
            callback,
            every_nth: every_nth.max(1),
            fire_count: 0,
            delay,
        });
        debug!("{event}: registered handler {id:?} every {every_nth} after {delay:?}");
        id
    }

    pub fn unregister(&mut self, event: TilterEvent, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        before != list.len()
    }

    pub fn clear(&mut self, event: TilterEvent) {
        self.handlers.remove(&event);
    }

    pub fn clear_all(&mut self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self, event: TilterEvent) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }

    /// Count one occurrence and return the handlers that are due, in registration order.
    pub fn fire(&mut self, event: TilterEvent) -> Vec<DueCall> {
        let Some(list) = self.handlers.get_mut(&event) else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for reg in list.iter_mut() {
            reg.fire_count += 1;
            if reg.fire_count == reg.every_nth {
                reg.fire_count = 0;
                due.push(DueCall {
                    event,
                    id: reg.id,
                    callback: reg.callback.clone(),
                    delay: reg.delay,
                });
            }
        }
        due
    }
}

/// Fire `event` and run the due handlers without holding the registry lock.
pub fn dispatch(registry: &Mutex<EventRegistry>, event: TilterEvent) {
    let due = registry.lock().fire(event);
    if !due.is_empty() {
        debug!("{event}: running {} handler(s)", due.len());
    }
    for call in due {
        call.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn every_nth_fires_on_multiples_only() {
        let registry = Mutex::new(EventRegistry::new());
        let (hits, cb) = counter();
        registry
            .lock()
            .register(TilterEvent::OnPosUp, cb, 2, Duration::ZERO);

        let mut seen = Vec::new();
        for _ in 0..4 {
            dispatch(&registry, TilterEvent::OnPosUp);
            seen.push(hits.load(Ordering::SeqCst));
        }
        assert_eq!(seen, vec![0, 1, 1, 2]);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = Mutex::new(EventRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            registry.lock().register(
                TilterEvent::OnNegWait,
                Arc::new(move || order.lock().push(tag)),
                1,
                Duration::ZERO,
            );
        }
        dispatch(&registry, TilterEvent::OnNegWait);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let mut registry = EventRegistry::new();
        let (a_hits, a) = counter();
        let (b_hits, b) = counter();
        let a_id = registry.register(TilterEvent::OnNegUp, a, 1, Duration::ZERO);
        registry.register(TilterEvent::OnNegUp, b, 1, Duration::ZERO);

        assert!(registry.unregister(TilterEvent::OnNegUp, a_id));
        assert!(!registry.unregister(TilterEvent::OnNegUp, a_id));
        assert!(!registry.unregister(TilterEvent::OnPosUp, a_id));
        for call in registry.fire(TilterEvent::OnNegUp) {
            call.run();
        }
        assert_eq!(a_hits.load(Ordering::SeqCst), 0);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delayed_handler_blocks_dispatch() {
        let registry = Mutex::new(EventRegistry::new());
        let (hits, cb) = counter();
        registry
            .lock()
            .register(TilterEvent::OnNegWait, cb, 1, Duration::from_millis(40));

        let started = Instant::now();
        dispatch(&registry, TilterEvent::OnNegWait);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_touch_registry() {
        let registry = Arc::new(Mutex::new(EventRegistry::new()));
        let inner = registry.clone();
        registry.lock().register(
            TilterEvent::OnPosDown,
            Arc::new(move || inner.lock().clear(TilterEvent::OnPosUp)),
            1,
            Duration::ZERO,
        );
        dispatch(&registry, TilterEvent::OnPosDown);
        assert_eq!(registry.lock().handler_count(TilterEvent::OnPosDown), 1);
    }

    #[test]
    fn event_names_parse() {
        assert_eq!("onNegWait".parse::<TilterEvent>().unwrap(), TilterEvent::OnNegWait);
        assert!("onSideways".parse::<TilterEvent>().is_err());
    }
}
