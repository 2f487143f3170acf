//! Run queue and scheduling classes
//!
//! Every thread list in the kernel (the run queue and each wait queue) is a
//! singly-linked list threaded through [`ThreadCb::next`], kept sorted by the
//! scheduling class. Entries that compare equal keep their insertion order.
use core::iter;

use crate::{
    thread::{Link, RunState, ThreadCb, ThreadId},
    utils::Arena,
    Port,
};

pub(crate) type Threads<P> = Arena<ThreadId, ThreadCb<P>>;

/// The scheduling policy of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    /// Strict priority order. Threads of equal priority are served first-come
    /// first-served and rotate when their time slice runs out.
    RoundRobin,
    /// Like `RoundRobin`, but a thread's effective priority improves by one
    /// level each time it's passed over, and resets once it's dispatched.
    DynamicPriority,
    /// A randomized draw among ready threads, weighted by priority.
    Lottery,
    /// The ready thread with the earliest deadline runs first. Threads without
    /// a deadline run after all threads with one, in priority order.
    EarliestDeadlineFirst,
}

/// The operations a scheduling policy defines.
pub(crate) trait SchedClass<P: Port> {
    /// Return `true` if `a` is entitled to run no later than `b`.
    ///
    /// This is the one comparison used for list ordering, preemption on
    /// wake-up, and yield decisions.
    fn precedes_or_ties(&self, a: &ThreadCb<P>, b: &ThreadCb<P>) -> bool;

    /// Choose the thread to dispatch from the run queue.
    fn next_runnable(
        &self,
        threads: &Threads<P>,
        rq: &RunQueue,
        rng: &mut u32,
    ) -> Option<ThreadId>;

    /// Called on a context switch, after `chosen` was taken out of the run
    /// queue.
    fn dynamic_priority_update(&self, threads: &mut Threads<P>, rq: &RunQueue, chosen: ThreadId);

    /// Called on the thread being dispatched.
    fn post_schedule(&self, thread: &mut ThreadCb<P>, time_slice: u32);
}

impl<P: Port> SchedClass<P> for SchedPolicy {
    fn precedes_or_ties(&self, a: &ThreadCb<P>, b: &ThreadCb<P>) -> bool {
        match self {
            Self::RoundRobin | Self::Lottery => a.priority <= b.priority,
            Self::DynamicPriority => a.dyn_priority <= b.dyn_priority,
            Self::EarliestDeadlineFirst => {
                let key = |t: &ThreadCb<P>| (t.deadline.unwrap_or(u64::MAX), t.priority);
                key(a) <= key(b)
            }
        }
    }

    fn next_runnable(
        &self,
        threads: &Threads<P>,
        rq: &RunQueue,
        rng: &mut u32,
    ) -> Option<ThreadId> {
        match self {
            Self::Lottery => lottery_draw(threads, rq, rng),
            _ => rq.first_runnable(threads),
        }
    }

    fn dynamic_priority_update(&self, threads: &mut Threads<P>, rq: &RunQueue, chosen: ThreadId) {
        if *self != Self::DynamicPriority {
            return;
        }

        // Age everyone left behind. A uniform decrement keeps the queue
        // sorted. The idle thread doesn't age, or it would eventually
        // outrank real work.
        let mut cursor = rq.head;
        while let Some(id) = cursor {
            let thread = &mut threads[id];
            if !thread.is_idle {
                thread.dyn_priority = thread.dyn_priority.saturating_sub(1);
            }
            cursor = thread.next;
        }
        threads[chosen].dyn_priority = threads[chosen].priority;
    }

    fn post_schedule(&self, thread: &mut ThreadCb<P>, time_slice: u32) {
        thread.slice = time_slice;
        if *self == Self::DynamicPriority {
            thread.dyn_priority = thread.priority;
        }
    }
}

/// The number of lottery tickets a thread holds.
fn tickets<P: Port>(thread: &ThreadCb<P>) -> u32 {
    256 - u32::from(thread.priority)
}

/// Advance a xorshift32 generator.
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

fn lottery_draw<P: Port>(threads: &Threads<P>, rq: &RunQueue, rng: &mut u32) -> Option<ThreadId> {
    let contenders = || {
        rq.iter(threads)
            .filter(move |&id| threads[id].state == RunState::Running && !threads[id].is_idle)
    };

    let total: u32 = contenders().map(|id| tickets(&threads[id])).sum();
    if total == 0 {
        // Only the idle thread (if anyone) is left
        return rq.first_runnable(threads);
    }

    let mut draw = xorshift32(rng) % total;
    for id in contenders() {
        let t = tickets(&threads[id]);
        if draw < t {
            return Some(id);
        }
        draw -= t;
    }
    unreachable!()
}

/// Insert `id` into the list headed by `head`, after every entry that
/// precedes or ties with it.
pub(crate) fn list_insert<P: Port>(
    threads: &mut Threads<P>,
    head: &mut Option<ThreadId>,
    id: ThreadId,
    class: &impl SchedClass<P>,
) {
    let mut prev = None;
    let mut cursor = *head;
    while let Some(c) = cursor {
        if !class.precedes_or_ties(&threads[c], &threads[id]) {
            break;
        }
        prev = Some(c);
        cursor = threads[c].next;
    }

    threads[id].next = cursor;
    match prev {
        Some(p) => threads[p].next = Some(id),
        None => *head = Some(id),
    }
}

/// Remove `id` from the list headed by `head`. Return `false` if it isn't in
/// the list.
pub(crate) fn list_remove<P: Port>(
    threads: &mut Threads<P>,
    head: &mut Option<ThreadId>,
    id: ThreadId,
) -> bool {
    let mut prev: Option<ThreadId> = None;
    let mut cursor = *head;
    while let Some(c) = cursor {
        if c == id {
            let next = threads[c].next.take();
            match prev {
                Some(p) => threads[p].next = next,
                None => *head = next,
            }
            return true;
        }
        prev = Some(c);
        cursor = threads[c].next;
    }
    false
}

/// Iterate over the list starting at `head`.
pub(crate) fn list_iter<P: Port>(
    threads: &Threads<P>,
    head: Option<ThreadId>,
) -> impl Iterator<Item = ThreadId> + '_ {
    iter::successors(head, move |&id| threads[id].next)
}

/// The ready threads, except the current thread, and the wake list.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    pub(crate) head: Option<ThreadId>,
    /// Threads blocked on a wait queue, so that notifications recorded by
    /// interrupt handlers can be found without scanning every queue.
    pub(crate) wake_head: Option<ThreadId>,
    pub(crate) switch_count: u64,
}

impl RunQueue {
    pub(crate) fn add<P: Port>(
        &mut self,
        threads: &mut Threads<P>,
        id: ThreadId,
        class: &impl SchedClass<P>,
    ) {
        debug_assert_eq!(threads[id].link, Link::None);
        list_insert(threads, &mut self.head, id, class);
        threads[id].link = Link::RunQueue;
        threads[id].on_rq = true;
    }

    /// Return `false` if `id` wasn't in the run queue.
    pub(crate) fn remove<P: Port>(&mut self, threads: &mut Threads<P>, id: ThreadId) -> bool {
        if !list_remove(threads, &mut self.head, id) {
            return false;
        }
        threads[id].link = Link::None;
        true
    }

    /// Get the first entry that is ready to run.
    pub(crate) fn first_runnable<P: Port>(&self, threads: &Threads<P>) -> Option<ThreadId> {
        self.iter(threads)
            .find(|&id| threads[id].state == RunState::Running)
    }

    pub(crate) fn iter<'a, P: Port>(
        &self,
        threads: &'a Threads<P>,
    ) -> impl Iterator<Item = ThreadId> + 'a {
        list_iter(threads, self.head)
    }

    pub(crate) fn wake_list_add<P: Port>(&mut self, threads: &mut Threads<P>, id: ThreadId) {
        let thread = &mut threads[id];
        if thread.in_wake_list {
            return;
        }
        thread.in_wake_list = true;
        thread.wake_next = self.wake_head;
        self.wake_head = Some(id);
    }

    pub(crate) fn wake_list_remove<P: Port>(&mut self, threads: &mut Threads<P>, id: ThreadId) {
        if !threads[id].in_wake_list {
            return;
        }
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.wake_head;
        while let Some(c) = cursor {
            if c == id {
                let next = threads[c].wake_next.take();
                match prev {
                    Some(p) => threads[p].wake_next = next,
                    None => self.wake_head = next,
                }
                threads[c].in_wake_list = false;
                return;
            }
            prev = Some(c);
            cursor = threads[c].wake_next;
        }
    }

    pub(crate) fn wake_list_iter<'a, P: Port>(
        &self,
        threads: &'a Threads<P>,
    ) -> impl Iterator<Item = ThreadId> + 'a {
        iter::successors(self.wake_head, move |&id| threads[id].wake_next)
    }
}
