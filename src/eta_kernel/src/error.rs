//! Error types
use core::fmt;

/// All result codes (including success) that the kernel operations may
/// return.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation was successful. No additional information is available.
    Success = 0,
    /// A parameter is invalid in a way that is not covered by any other error
    /// codes.
    BadParam = -17,
    /// The current context disallows the operation.
    BadContext = -25,
    /// The operation could not complete because of insufficient memory.
    NoMemory = -33,
    /// The target object is in a state that disallows the operation.
    BadObjectState = -41,
    /// The message queue is full.
    QueueFull = -43,
    /// The operation timed out.
    Timeout = -50,
    /// The message queue is empty.
    NoData = -60,
}

impl ResultCode {
    /// Get the short name of the result code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::BadParam => "BadParam",
            Self::BadContext => "BadContext",
            Self::NoMemory => "NoMemory",
            Self::BadObjectState => "BadObjectState",
            Self::QueueFull => "QueueFull",
            Self::Timeout => "Timeout",
            Self::NoData => "NoData",
        }
    }

    /// Return `true` if `self` indicates the failure of an operation.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $(
                $( #[doc $( $vdoc:tt )*] )*
                $Variant:ident,
            )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone, Hash)]
        $vis enum $Name {
            $(
                $( #[doc $( $vdoc )*] )*
                $Variant = ResultCode::$Variant as _,
            )*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_error! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

// Single-cause errors. These are the building blocks for the operation-level
// errors below and let `?` convert between them.

define_error! {
    /// `BadContext`
    #[into(BootError)]
    #[into(CreateIpmQueueError)]
    #[into(CreateThreadError)]
    #[into(CreateTimerError)]
    #[into(DestroyThreadError)]
    #[into(GetMessageError)]
    #[into(InitClockError)]
    #[into(JoinError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(NiceError)]
    #[into(NotifyError)]
    #[into(PostMessageError)]
    #[into(SetDeadlineError)]
    #[into(SignalSemaphoreError)]
    #[into(SleepError)]
    #[into(TryLockMutexError)]
    #[into(TryWaitSemaphoreError)]
    #[into(UnlockMutexError)]
    #[into(UnparkError)]
    #[into(WaitError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(WaitTimeoutError)]
    #[into(YieldError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// `BadParam`
    #[into(CreateThreadError)]
    #[into(CreateTimerError)]
    #[into(DestroyThreadError)]
    #[into(InitClockError)]
    #[into(JoinError)]
    #[into(NiceError)]
    #[into(PrepareStackError)]
    pub enum BadParamError {
        BadParam,
    }
}

define_error! {
    /// `NoMemory`
    #[into(BootError)]
    #[into(CreateIpmQueueError)]
    #[into(CreateThreadError)]
    #[into(PrepareStackError)]
    pub enum NoMemoryError {
        NoMemory,
    }
}

define_error! {
    /// `BadObjectState`
    #[into(BootError)]
    #[into(ClockEnableError)]
    #[into(InitClockError)]
    #[into(SetDeadlineError)]
    #[into(UnparkError)]
    pub enum BadObjectStateError {
        BadObjectState,
    }
}

define_error! {
    /// `Timeout`
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(TryWaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(WaitTimeoutError)]
    pub enum TimeoutError {
        Timeout,
    }
}

// Operation-level errors

define_error! {
    /// Error type for [`Kernel::boot`](crate::Kernel::boot).
    pub enum BootError {
        /// CPU Lock is already active.
        BadContext,
        /// The kernel is already running, or the port refused to enable the
        /// system clock.
        BadObjectState,
        /// Stack allocation for the main or the idle thread failed.
        NoMemory,
    }
}

define_error! {
    /// Error type for [`Port::prepare_stack`](crate::Port::prepare_stack).
    #[into(CreateThreadError)]
    pub enum PrepareStackError {
        /// The stack is too small to hold the initial context.
        BadParam,
        /// The port ran out of resources.
        NoMemory,
    }
}

define_error! {
    /// Error type for [`Port::clock_enable`](crate::Port::clock_enable).
    #[into(InitClockError)]
    pub enum ClockEnableError {
        /// The clock source can't be enabled.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Kernel::clock_source_init`](crate::Kernel::clock_source_init).
    pub enum InitClockError {
        BadContext,
        /// The frequency is zero, or the name is already taken.
        BadParam,
        /// The port refused to enable the clock source.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Kernel::thread_create`](crate::Kernel::thread_create).
    pub enum CreateThreadError {
        BadContext,
        /// The name is too long, the stack size is zero, or the priority is
        /// reserved for the idle thread.
        BadParam,
        /// The stack couldn't be allocated.
        NoMemory,
    }
}

define_error! {
    /// Error type for [`Kernel::thread_destroy`](crate::Kernel::thread_destroy)
    /// and [`Kernel::thread_destroy_by_name`](crate::Kernel::thread_destroy_by_name).
    pub enum DestroyThreadError {
        BadContext,
        /// No thread has the given name.
        BadParam,
    }
}

define_error! {
    /// Error type for [`Kernel::join`](crate::Kernel::join).
    pub enum JoinError {
        BadContext,
        /// A thread can't join itself.
        BadParam,
    }
}

define_error! {
    /// Error type for [`Kernel::yield_now`](crate::Kernel::yield_now).
    pub enum YieldError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Kernel::sleep`](crate::Kernel::sleep).
    pub enum SleepError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Kernel::nice`](crate::Kernel::nice).
    pub enum NiceError {
        BadContext,
        /// The priority is reserved for the idle thread.
        BadParam,
    }
}

define_error! {
    /// Error type for [`Kernel::unpark`](crate::Kernel::unpark).
    pub enum UnparkError {
        BadContext,
        /// The thread doesn't exist.
        BadParam,
        /// The thread has exited.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Kernel::set_deadline`](crate::Kernel::set_deadline).
    pub enum SetDeadlineError {
        BadContext,
        /// The kernel doesn't use the earliest-deadline-first policy.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Kernel::timer_create`](crate::Kernel::timer_create).
    pub enum CreateTimerError {
        BadContext,
        /// A periodic timer was requested with a zero period.
        BadParam,
    }
}

define_error! {
    /// Error type for [`ThreadQueue::wait`](crate::ThreadQueue::wait).
    pub enum WaitError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`ThreadQueue::wait_timeout`](crate::ThreadQueue::wait_timeout).
    pub enum WaitTimeoutError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`ThreadQueue::notify`](crate::ThreadQueue::notify).
    pub enum NotifyError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Mutex::lock`](crate::Mutex::lock).
    pub enum LockMutexError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Mutex::lock_timeout`](crate::Mutex::lock_timeout).
    pub enum LockMutexTimeoutError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Mutex::try_lock`](crate::Mutex::try_lock).
    pub enum TryLockMutexError {
        BadContext,
        /// The mutex is held by another thread.
        Timeout,
    }
}

define_error! {
    /// Error type for [`Mutex::unlock`](crate::Mutex::unlock).
    pub enum UnlockMutexError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Semaphore::wait`](crate::Semaphore::wait).
    pub enum WaitSemaphoreError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Semaphore::wait_timeout`](crate::Semaphore::wait_timeout).
    pub enum WaitSemaphoreTimeoutError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Semaphore::try_wait`](crate::Semaphore::try_wait).
    pub enum TryWaitSemaphoreError {
        BadContext,
        /// No permit is available.
        Timeout,
    }
}

define_error! {
    /// Error type for [`Semaphore::signal`](crate::Semaphore::signal).
    pub enum SignalSemaphoreError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`IpmQueue::new`](crate::IpmQueue::new).
    pub enum CreateIpmQueueError {
        BadContext,
        NoMemory,
    }
}

define_error! {
    /// Error type for [`IpmQueue::post`](crate::IpmQueue::post).
    pub enum PostMessageError {
        BadContext,
        /// The write index reached the capacity. The queue must be reset
        /// before it accepts further messages.
        QueueFull,
    }
}

define_error! {
    /// Error type for [`IpmQueue::get`](crate::IpmQueue::get).
    pub enum GetMessageError {
        BadContext,
        /// The queue was still empty after the wait.
        NoData,
    }
}

/// Unwrap the result of a wait operation that has no timeout.
#[inline]
pub(super) fn expect_not_timeout<T>(x: Result<T, TimeoutError>) -> T {
    match x {
        Ok(x) => x,
        Err(TimeoutError::Timeout) => unreachable!("got a timeout from a wait without timeout"),
    }
}
