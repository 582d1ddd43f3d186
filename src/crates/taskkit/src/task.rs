//! The `Task` abstraction shared by every wrapper
//!
//! A task is a named callable returning `Result<Output, ExecError>`. Plain
//! closures become tasks through [`task`] / [`named_task`]; the retry, timeout
//! and latency wrappers are tasks themselves, so they nest in any order:
//!
//! ```rust
//! use std::time::Duration;
//! use taskkit::{task, RetryPolicy, Task, TaskExt, TimeoutGuard};
//!
//! let guard = TimeoutGuard::new().unwrap();
//! let add = task(|a: i32, b: i32| Ok::<_, std::io::Error>(a + b))
//!     .with_timeout(&guard, Duration::from_secs(1))
//!     .with_retry(RetryPolicy::new(3).with_initial_delay(0.0))
//!     .timed();
//!
//! assert_eq!(add.run((2, 3)).unwrap(), 5);
//! ```
//!
//! Tuple arguments are spread into multi-parameter closures; a one-parameter
//! closure receives its argument as-is (including a tuple, if it asks for one).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoxError, ExecError, Result, TaskFailure};
use crate::retry::{Retry, RetryPolicy};
use crate::timed::Timed;
use crate::timeout::{Timeout, TimeoutGuard};

/// Identity of a task, used in log lines and errors
pub trait Named {
    fn name(&self) -> &str;
}

/// A unit of work taking `Args`
pub trait Task<Args>: Named + Send + Sync {
    type Output;

    fn run(&self, args: Args) -> Result<Self::Output>;
}

impl<T: Named + ?Sized> Named for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<Args, T: Task<Args> + ?Sized> Task<Args> for Arc<T> {
    type Output = T::Output;

    fn run(&self, args: Args) -> Result<Self::Output> {
        (**self).run(args)
    }
}

/// Marker: the closure takes the argument value as its single parameter
pub enum Single {}

/// Marker: the closure takes the tuple's elements as separate parameters
pub enum Spread {}

/// Closures callable with `Args`, selected by the `Marker` calling convention
pub trait Call<Args, Marker>: Send + Sync + 'static {
    type Output;

    fn call(&self, args: Args) -> std::result::Result<Self::Output, BoxError>;
}

impl<F, A, T, E> Call<A, Single> for F
where
    F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    type Output = T;

    fn call(&self, args: A) -> std::result::Result<T, BoxError> {
        self(args).map_err(Into::into)
    }
}

macro_rules! impl_spread_call {
    ($($arg:ident),+) => {
        impl<F, $($arg,)+ T, E> Call<($($arg,)+), Spread> for F
        where
            F: Fn($($arg),+) -> std::result::Result<T, E> + Send + Sync + 'static,
            E: Into<BoxError>,
        {
            type Output = T;

            #[allow(non_snake_case)]
            fn call(&self, args: ($($arg,)+)) -> std::result::Result<T, BoxError> {
                let ($($arg,)+) = args;
                self($($arg),+).map_err(Into::into)
            }
        }
    };
}

impl_spread_call!(A, B);
impl_spread_call!(A, B, C);
impl_spread_call!(A, B, C, D);

/// A closure adapted into a [`Task`]
pub struct FnTask<F, M> {
    name: String,
    func: F,
    _marker: PhantomData<fn() -> M>,
}

impl<F, M> FnTask<F, M> {
    /// Rename the task
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, M> Named for FnTask<F, M> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, M, Args> Task<Args> for FnTask<F, M>
where
    F: Call<Args, M>,
{
    type Output = F::Output;

    fn run(&self, args: Args) -> Result<Self::Output> {
        self.func
            .call(args)
            .map_err(|e| ExecError::Task(TaskFailure::new(self.name.clone(), e)))
    }
}

/// Turn a closure or function into a task named after its type path
pub fn task<F, M>(func: F) -> FnTask<F, M> {
    FnTask {
        name: std::any::type_name::<F>().to_string(),
        func,
        _marker: PhantomData,
    }
}

/// Turn a closure or function into a task with an explicit name
pub fn named_task<F, M>(name: impl Into<String>, func: F) -> FnTask<F, M> {
    task(func).with_name(name)
}

/// Wrapping combinators available on every task
pub trait TaskExt: Named + Sized {
    /// Retry failed calls according to `policy`
    fn with_retry(self, policy: RetryPolicy) -> Retry<Self> {
        Retry::new(self, policy)
    }

    /// Bound each call by `timeout`, running it on `guard`'s worker
    fn with_timeout(self, guard: &TimeoutGuard, timeout: Duration) -> Timeout<Self> {
        guard.wrap(self, timeout)
    }

    /// Log the latency of each call
    fn timed(self) -> Timed<Self> {
        Timed::new(self)
    }
}

impl<T: Named> TaskExt for T {}
