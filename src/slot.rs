//! The fixed-size array of slots backing a session pool.
//!
//! Each live session occupies exactly one slot. Slot states only change
//! through compare-and-swap, so two tasks racing to act on the same
//! session (for example, a caller returning it while the evictor closes it)
//! can never both win.

use debug_ignore::DebugIgnore;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

// An index into the slot array.
pub(crate) type SlotId = usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    // No session. The only state which does not count as "live".
    //
    // - (On reservation) State becomes Creating
    Empty = 0,

    // A session is being opened for a caller.
    //
    // - (On success) State becomes Leased
    // - (On failure) State becomes Empty
    Creating = 1,

    // An open session is waiting in the idle stack.
    //
    // - (On lease) State becomes Leased
    // - (On eviction or termination) State becomes Closing
    Idle = 2,

    // A caller holds the session.
    //
    // - (On healthy return) State becomes Idle, or stays Leased when the
    //   session is handed directly to a waiter
    // - (On broken return) State becomes Closing
    Leased = 3,

    // The session is being deleted.
    //
    // - (When the delete finishes) State becomes Empty
    Closing = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Empty,
            1 => State::Creating,
            2 => State::Idle,
            3 => State::Leased,
            _ => State::Closing,
        }
    }
}

struct Slot<S> {
    state: AtomicU8,
    session: Mutex<DebugIgnore<Option<Arc<S>>>>,
    idle_since: Mutex<Instant>,
}

impl<S> Slot<S> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Empty as u8),
            session: Mutex::new(DebugIgnore(None)),
            idle_since: Mutex::new(Instant::now()),
        }
    }
}

/// How many slots are in each state, at a single point in time.
#[derive(Clone, Debug, Default)]
pub(crate) struct Census {
    pub(crate) creating: usize,
    pub(crate) idle: usize,
    pub(crate) leased: usize,
    pub(crate) closing: usize,
}

pub(crate) struct Slots<S> {
    slots: Box<[Slot<S>]>,

    // The number of slots which are not Empty, or are about to stop being
    // Empty. Never exceeds "slots.len()".
    live: AtomicUsize,
}

impl<S> Slots<S> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Reserves an empty slot for a new session, moving it to Creating.
    ///
    /// Returns `None` if every slot is live.
    pub(crate) fn reserve(&self) -> Option<SlotId> {
        let capacity = self.capacity();
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < capacity).then_some(live + 1)
            })
            .ok()?;

        // Slots are marked Empty before "live" is decremented, so having
        // won an increment guarantees an Empty slot exists. Other reservers
        // may take the first ones we see, so keep looking until we get one.
        loop {
            for (id, slot) in self.slots.iter().enumerate() {
                if slot
                    .state
                    .compare_exchange(
                        State::Empty as u8,
                        State::Creating as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(id);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Stores a newly opened session, leasing it to its creator.
    pub(crate) fn fill(&self, id: SlotId, session: Arc<S>) {
        let slot = &self.slots[id];
        *slot.session.lock().unwrap() = DebugIgnore(Some(session));
        slot.state.store(State::Leased as u8, Ordering::Release);
    }

    pub(crate) fn state(&self, id: SlotId) -> State {
        State::from_u8(self.slots[id].state.load(Ordering::Acquire))
    }

    /// Moves a slot from one state to another, returning false if it was
    /// not in the expected state.
    pub(crate) fn transition(&self, id: SlotId, from: State, to: State) -> bool {
        self.slots[id]
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn session(&self, id: SlotId) -> Option<Arc<S>> {
        self.slots[id].session.lock().unwrap().0.clone()
    }

    /// Moves a leased slot to Idle, starting its idle clock.
    pub(crate) fn mark_idle(&self, id: SlotId) -> bool {
        *self.slots[id].idle_since.lock().unwrap() = Instant::now();
        self.transition(id, State::Leased, State::Idle)
    }

    pub(crate) fn idle_since(&self, id: SlotId) -> Instant {
        *self.slots[id].idle_since.lock().unwrap()
    }

    /// Empties a slot, returning the session it held, if any.
    pub(crate) fn free(&self, id: SlotId) -> Option<Arc<S>> {
        let slot = &self.slots[id];
        let session = slot.session.lock().unwrap().0.take();
        let old = State::from_u8(slot.state.swap(State::Empty as u8, Ordering::AcqRel));
        if old != State::Empty {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        session
    }

    pub(crate) fn census(&self) -> Census {
        let mut census = Census::default();
        for slot in self.slots.iter() {
            match State::from_u8(slot.state.load(Ordering::Acquire)) {
                State::Empty => (),
                State::Creating => census.creating += 1,
                State::Idle => census.idle += 1,
                State::Leased => census.leased += 1,
                State::Closing => census.closing += 1,
            }
        }
        census
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserve_is_bounded() {
        let slots = Slots::<()>::new(2);
        let a = slots.reserve().unwrap();
        let b = slots.reserve().unwrap();
        assert_ne!(a, b);
        assert!(slots.reserve().is_none());
        assert_eq!(slots.live(), 2);

        assert!(slots.free(a).is_none());
        assert_eq!(slots.live(), 1);
        assert_eq!(slots.reserve(), Some(a));
    }

    #[test]
    fn freeing_twice_counts_once() {
        let slots = Slots::<()>::new(1);
        let id = slots.reserve().unwrap();
        slots.free(id);
        slots.free(id);
        assert_eq!(slots.live(), 0);
    }

    #[test]
    fn transitions_race_to_one_winner() {
        let slots = Slots::new(1);
        let id = slots.reserve().unwrap();
        slots.fill(id, Arc::new("session"));
        assert_eq!(slots.state(id), State::Leased);
        assert!(slots.mark_idle(id));

        // A lease and an eviction race for the same idle session.
        assert!(slots.transition(id, State::Idle, State::Closing));
        assert!(!slots.transition(id, State::Idle, State::Leased));

        assert_eq!(slots.free(id).as_deref(), Some(&"session"));
        assert_eq!(slots.state(id), State::Empty);
    }

    #[test]
    fn census_counts_states() {
        let slots = Slots::new(4);
        let a = slots.reserve().unwrap();
        let b = slots.reserve().unwrap();
        let c = slots.reserve().unwrap();
        slots.fill(a, Arc::new(()));
        slots.fill(b, Arc::new(()));
        slots.mark_idle(b);
        let _ = c;

        let census = slots.census();
        assert_eq!(census.creating, 1);
        assert_eq!(census.idle, 1);
        assert_eq!(census.leased, 1);
        assert_eq!(census.closing, 0);
    }

    #[test]
    fn concurrent_reservations_never_share_a_slot() {
        let slots = Arc::new(Slots::<()>::new(8));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let slots = slots.clone();
                std::thread::spawn(move || slots.reserve())
            })
            .collect();
        let mut reserved: Vec<SlotId> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();
        reserved.sort();
        assert_eq!(reserved, (0..8).collect::<Vec<_>>());
        assert_eq!(slots.live(), 8);
    }
}
