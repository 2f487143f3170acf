//! Mutexes, semaphores and thread queues on the simulated processor
use eta_kernel::{Kernel, KernelCfg, Mutex, Semaphore, ThreadQueue};
use once_cell::sync::OnceCell;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex as StdMutex,
};

fn record(log: &StdMutex<Vec<String>>, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

fn take(log: &StdMutex<Vec<String>>) -> Vec<String> {
    std::mem::take(&mut *log.lock().unwrap())
}

mod mutex_exclusion {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    static MUTEX: OnceCell<Mutex<TestPort>> = OnceCell::new();
    static IN_CRITICAL: AtomicBool = AtomicBool::new(false);
    static ENTRIES: AtomicUsize = AtomicUsize::new(0);

    fn worker(kernel: &'static Kernel<TestPort>, _: usize) {
        let m = MUTEX.get().unwrap();
        for _ in 0..3 {
            m.lock().unwrap();
            m.lock().unwrap();
            assert!(!IN_CRITICAL.swap(true, Ordering::Relaxed));

            // Block while holding the mutex so the others contend
            kernel.sleep(2).unwrap();

            IN_CRITICAL.store(false, Ordering::Relaxed);
            ENTRIES.fetch_add(1, Ordering::Relaxed);
            m.unlock().unwrap();
            assert!(m.is_locked().unwrap());
            m.unlock().unwrap();
        }
    }

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        assert!(MUTEX.set(Mutex::new(kernel).unwrap()).is_ok());
        let workers: Vec<_> = (0..3)
            .map(|i| kernel.thread_create("worker", worker, i, 1024, 100).unwrap())
            .collect();
        for worker in workers {
            kernel.join(worker).unwrap();
        }
        assert_eq!(ENTRIES.load(Ordering::Relaxed), 9);
        assert!(!MUTEX.get().unwrap().is_locked().unwrap());
        eta_port_std::shutdown::<TestPort>();
    }

    #[test]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}

mod mutex_timeout {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    static MUTEX: OnceCell<Mutex<TestPort>> = OnceCell::new();
    static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn holder(kernel: &'static Kernel<TestPort>, _: usize) {
        let m = MUTEX.get().unwrap();
        m.lock().unwrap();
        record(&LOG, "holder: locked");
        kernel.sleep(20).unwrap();
        record(&LOG, "holder: unlocking");
        m.unlock().unwrap();
    }

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        assert!(MUTEX.set(Mutex::new(kernel).unwrap()).is_ok());
        let m = MUTEX.get().unwrap();
        let holder = kernel.thread_create("holder", holder, 0, 1024, 100).unwrap();
        kernel.sleep(1).unwrap();

        assert_eq!(
            m.lock_timeout(5),
            Err(eta_kernel::LockMutexTimeoutError::Timeout)
        );
        assert_eq!(m.try_lock(), Err(eta_kernel::TryLockMutexError::Timeout));
        record(&LOG, "main: timed out");

        m.lock().unwrap();
        record(&LOG, "main: locked");
        assert_eq!(m.owner().unwrap(), Some(kernel.current_thread().unwrap()));
        m.unlock().unwrap();
        kernel.join(holder).unwrap();

        assert_eq!(
            take(&LOG),
            ["holder: locked", "main: timed out", "holder: unlocking", "main: locked"]
        );
        let sys = kernel.system_clock();
        // The holder woke up on tick 20 and handed the mutex over right away
        assert_eq!(kernel.clock_source_get_ticks(sys).unwrap(), 20);
        eta_port_std::shutdown::<TestPort>();
    }

    #[test]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}

mod semaphore_waiters {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    static SEM: OnceCell<Semaphore<TestPort>> = OnceCell::new();
    static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn waiter(_: &'static Kernel<TestPort>, i: usize) {
        SEM.get().unwrap().wait().unwrap();
        record(&LOG, format!("waiter {}", i));
    }

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        assert!(SEM.set(Semaphore::new(kernel, 0).unwrap()).is_ok());
        let sem = SEM.get().unwrap();
        let waiters: Vec<_> = (0..2)
            .map(|i| kernel.thread_create("waiter", waiter, i, 1024, 100).unwrap())
            .collect();

        kernel.sleep(1).unwrap();
        assert_eq!(sem.value().unwrap(), -2);

        // Each signal hands a permit to the waiter that arrived first, which
        // preempts us right away
        sem.signal().unwrap();
        assert_eq!(take(&LOG), ["waiter 0"]);
        sem.signal().unwrap();
        assert_eq!(take(&LOG), ["waiter 1"]);
        assert_eq!(sem.value().unwrap(), 0);

        assert_eq!(
            sem.wait_timeout(5),
            Err(eta_kernel::WaitSemaphoreTimeoutError::Timeout)
        );
        assert_eq!(sem.value().unwrap(), 0);

        for waiter in waiters {
            kernel.join(waiter).unwrap();
        }
        eta_port_std::shutdown::<TestPort>();
    }

    #[test]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}

mod semaphore_timeout_race {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    static SEM: OnceCell<Semaphore<TestPort>> = OnceCell::new();
    static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn waiter(_: &'static Kernel<TestPort>, _: usize) {
        match SEM.get().unwrap().wait_timeout(5) {
            Ok(()) => record(&LOG, "acquired"),
            Err(_) => record(&LOG, "timed out"),
        }
    }

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        assert!(SEM.set(Semaphore::new(kernel, 0).unwrap()).is_ok());
        let sem = SEM.get().unwrap();
        let waiter = kernel.thread_create("waiter", waiter, 0, 1024, 150).unwrap();
        kernel.sleep(1).unwrap();
        assert_eq!(sem.value().unwrap(), -1);

        // The waiter times out but can't run before us
        for _ in 0..4 {
            eta_port_std::tick::<TestPort>();
        }
        assert_eq!(sem.value().unwrap(), 0);

        // Nobody is waiting for this permit anymore
        sem.signal().unwrap();
        kernel.join(waiter).unwrap();
        assert_eq!(take(&LOG), ["timed out"]);
        assert_eq!(sem.value().unwrap(), 1);

        sem.try_wait().unwrap();
        assert_eq!(
            sem.wait_timeout(3),
            Err(eta_kernel::WaitSemaphoreTimeoutError::Timeout)
        );
        assert_eq!(sem.value().unwrap(), 0);
        eta_port_std::shutdown::<TestPort>();
    }

    #[test]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}

mod notify_from_isr {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    static QUEUE: OnceCell<ThreadQueue<TestPort>> = OnceCell::new();
    static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn waiter(_: &'static Kernel<TestPort>, _: usize) {
        QUEUE.get().unwrap().wait().unwrap();
        record(&LOG, "woken");
    }

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        assert!(QUEUE.set(ThreadQueue::new(kernel).unwrap()).is_ok());
        let queue = QUEUE.get().unwrap();
        let waiter = kernel.thread_create("waiter", waiter, 0, 1024, 100).unwrap();
        kernel.sleep(1).unwrap();
        assert!(queue.has_waiters().unwrap());

        // The wake-up is deferred to the end of the handler
        eta_port_std::raise_interrupt::<TestPort>(|isr| {
            queue.notify_from_isr(isr);
            record(&LOG, "handler");
        });
        record(&LOG, "after handler");
        assert_eq!(take(&LOG), ["handler", "woken", "after handler"]);
        kernel.join(waiter).unwrap();

        // With nobody waiting, the event is latched for the next wait
        eta_port_std::raise_interrupt::<TestPort>(|isr| queue.notify_from_isr(isr));
        eta_port_std::raise_interrupt::<TestPort>(|isr| queue.notify_from_isr(isr));
        queue.wait().unwrap();
        assert_eq!(
            queue.wait_timeout(3),
            Err(eta_kernel::WaitTimeoutError::Timeout)
        );
        eta_port_std::shutdown::<TestPort>();
    }

    #[test]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}

mod deadlock {
    use super::*;

    eta_port_std::use_port!(unsafe struct TestPort);

    fn main_thread(kernel: &'static Kernel<TestPort>, _: usize) {
        let queue = ThreadQueue::new(kernel).unwrap();
        let _ = queue.wait();
        unreachable!();
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn run() {
        eta_port_std::boot::<TestPort>(KernelCfg::new(), main_thread, 0);
    }
}
