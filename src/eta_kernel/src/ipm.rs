//! Inter-process message queues
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::{
    error::{
        expect_not_timeout, CreateIpmQueueError, GetMessageError, NoMemoryError, PostMessageError,
    },
    klock, state, BadContextError, Isr, Kernel, Port, ThreadQueue,
};

/// A bounded queue of borrowed messages.
///
/// Messages aren't copied; the queue stores the slices it's given. The
/// write index only moves forward, so once `capacity` messages have been
/// posted, the queue accepts no more until it's [`reset`](Self::reset).
pub struct IpmQueue<'a, P: Port> {
    queue: ThreadQueue<P>,
    inner: spin::Mutex<IpmInner<'a>>,
}

struct IpmInner<'a> {
    msgs: Box<[Option<&'a [u8]>]>,
    wr: usize,
    rd: usize,
}

impl IpmInner<'_> {
    fn is_full(&self) -> bool {
        self.wr == self.msgs.len()
    }
}

impl<'a, P: Port> IpmQueue<'a, P> {
    /// Construct a queue that accepts `capacity` messages between resets.
    pub fn new(kernel: &'static Kernel<P>, capacity: usize) -> Result<Self, CreateIpmQueueError> {
        let mut msgs = Vec::new();
        msgs.try_reserve_exact(capacity)
            .map_err(|_| NoMemoryError::NoMemory)?;
        msgs.resize(capacity, None);

        Ok(Self {
            queue: ThreadQueue::new(kernel)?,
            inner: spin::Mutex::new(IpmInner {
                msgs: msgs.into_boxed_slice(),
                wr: 0,
                rd: 0,
            }),
        })
    }

    fn kernel(&self) -> &'static Kernel<P> {
        self.queue.kernel()
    }

    /// Claim the next write slot.
    fn push(&self, msg: &'a [u8]) -> Result<(), PostMessageError> {
        let mut inner = self.inner.lock();
        if inner.is_full() {
            return Err(PostMessageError::QueueFull);
        }
        let wr = inner.wr;
        inner.msgs[wr] = Some(msg);
        inner.wr += 1;
        Ok(())
    }

    /// Take the message at the read index. Also return `true` if more
    /// messages remain.
    fn pop(&self) -> Option<(&'a [u8], bool)> {
        let mut inner = self.inner.lock();
        if inner.rd >= inner.wr {
            return None;
        }
        let rd = inner.rd;
        let msg = inner.msgs[rd].take()?;
        inner.rd += 1;
        Some((msg, inner.rd < inner.wr))
    }

    /// Post a message, waking a receiver. Followed by a yield point.
    pub fn post(&self, msg: &'a [u8]) -> Result<(), PostMessageError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel(), lock.borrow_mut())?;
        self.push(msg)?;
        self.kernel()
            .state
            .write(&mut *lock)
            .notify(self.queue.id());
        self.kernel().unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Post a message from an interrupt handler. A receiver is woken at the
    /// next scheduling point.
    pub fn post_from_isr(&self, isr: Isr<'_, P>, msg: &'a [u8]) -> Result<(), PostMessageError> {
        let _ = isr;
        let mut lock = klock::lock_cpu::<P>()?;
        self.push(msg)?;
        self.kernel()
            .state
            .write(&mut *lock)
            .notify_from_isr(self.queue.id());
        Ok(())
    }

    /// Receive the next message, blocking while the queue is empty.
    ///
    /// Being woken doesn't guarantee a message: if the queue is still empty
    /// after the wait, this returns `NoData` and the caller should retry.
    pub fn get(&self) -> Result<&'a [u8], GetMessageError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel(), lock.borrow_mut())?;
        let kernel = self.kernel();

        let popped = match self.pop() {
            Some(popped) => popped,
            None => {
                expect_not_timeout(kernel.wait_queue(lock.borrow_mut(), self.queue.id(), None));
                match self.pop() {
                    Some(popped) => popped,
                    None => {
                        log::debug!("{:?}: woken without data", self.queue.id());
                        kernel.unlock_cpu_and_check_preemption(lock);
                        return Err(GetMessageError::NoData);
                    }
                }
            }
        };

        let (msg, more) = popped;
        let sched = kernel.state.write(&mut *lock);
        if more && !sched.queue_is_empty(self.queue.id()) {
            // Let the next receiver proceed
            sched.notify(self.queue.id());
        }
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(msg)
    }

    /// Rewind both indices so the queue can be filled again. Pending messages
    /// are discarded.
    ///
    /// Returns `false` without doing anything if a thread is blocked on the
    /// queue or a wake-up is latched.
    pub fn reset(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        if self.kernel().state.read(&*lock).queues[self.queue.id()].head
            != crate::wait::QueueHead::Empty
        {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        inner.msgs.iter_mut().for_each(|m| *m = None);
        inner.wr = 0;
        inner.rd = 0;
        Ok(true)
    }

    /// Get the number of messages waiting to be received.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.wr - inner.rd
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().msgs.len()
    }
}

impl<P: Port> fmt::Debug for IpmQueue<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("IpmQueue")
            .field("queue", &self.queue)
            .field("capacity", &inner.msgs.len())
            .field("wr", &inner.wr)
            .field("rd", &inner.rd)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn full_queue_rejects_until_reset() {
        let (kernel, _) = testing::kernel();
        let q = IpmQueue::new(kernel, 2).unwrap();
        q.post(b"one").unwrap();
        q.post(b"two").unwrap();
        assert_eq!(q.post(b"three"), Err(PostMessageError::QueueFull));
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().unwrap(), b"one");
        assert_eq!(q.get().unwrap(), b"two");
        // Draining doesn't free the slots
        assert_eq!(q.post(b"three"), Err(PostMessageError::QueueFull));
    }

    #[test]
    fn reset_refuses_latched_wakeup() {
        let (kernel, _) = testing::kernel();
        let q = IpmQueue::new(kernel, 1).unwrap();

        // Nobody was waiting, so the notification is latched
        q.post(b"msg").unwrap();
        assert_eq!(q.get().unwrap(), b"msg");
        assert!(!q.reset().unwrap());

        // The latched wake-up satisfies the wait, but there's no data
        assert_eq!(q.get(), Err(GetMessageError::NoData));
        assert!(q.reset().unwrap());
        assert!(q.is_empty());
        q.post(b"again").unwrap();
        assert_eq!(q.capacity(), 1);
    }

    #[test]
    fn zero_capacity_queue_is_always_full() {
        let (kernel, _) = testing::kernel();
        let q = IpmQueue::new(kernel, 0).unwrap();
        assert_eq!(q.post(b""), Err(PostMessageError::QueueFull));
    }
}
