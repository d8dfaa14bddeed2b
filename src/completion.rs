//! Single-assignment completion cells, the currency every chunk status is paid in.
//!
//! A [`Completion`] is written once and read by anyone holding a clone.
//! Callbacks registered before completion run on whichever thread completes
//! it, callbacks registered after run immediately on the registering thread.

use crate::executor::{Executor, Job};
use crate::prelude::*;
use parking_lot::Condvar;
use std::time::Duration;

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(T),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> core::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let done = matches!(*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Completion").field("done", &done).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self::with_state(State::Pending(vec![]))
    }
    pub fn completed(value: T) -> Self {
        Self::with_state(State::Done(value))
    }
    fn with_state(state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                done: Condvar::new(),
            }),
        }
    }

    /// Stores `value` unless something got there first. Returns whether it won.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = core::mem::take(callbacks);
                    *state = State::Done(value.clone());
                    callbacks
                }
            }
        };
        self.inner.done.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    pub fn get_now(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }
    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn on_complete(&self, f: impl FnOnce(&T) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(f)),
            State::Done(value) => {
                let value = value.clone();
                drop(state);
                f(&value);
            }
        }
    }

    pub fn map<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completion<U> {
        let out = Completion::new();
        let result = out.clone();
        self.on_complete(move |value| {
            result.complete(f(value.clone()));
        });
        out
    }

    /// Like [`Self::map`], but `f` runs as a job on `executor`.
    pub fn map_on<U: Clone + Send + 'static>(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completion<U> {
        self.then_compose_on(executor, move |value| Completion::completed(f(value)))
    }

    pub fn then_compose<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Completion<U> + Send + 'static,
    ) -> Completion<U> {
        let out = Completion::new();
        let result = out.clone();
        self.on_complete(move |value| forward(f(value.clone()), result));
        out
    }

    pub fn then_compose_on<U: Clone + Send + 'static>(
        &self,
        executor: Arc<dyn Executor>,
        f: impl FnOnce(T) -> Completion<U> + Send + 'static,
    ) -> Completion<U> {
        let out = Completion::new();
        let result = out.clone();
        self.on_complete(move |value| {
            let value = value.clone();
            let job: Job = Box::new(move || forward(f(value), result));
            executor.execute(job);
        });
        out
    }

    /// Resolves once both sides have, with `f` applied to the pair.
    pub fn combine<U, R>(
        &self,
        other: &Completion<U>,
        f: impl FnOnce(T, U) -> R + Send + 'static,
    ) -> Completion<R>
    where
        U: Clone + Send + 'static,
        R: Clone + Send + 'static,
    {
        let other = other.clone();
        self.then_compose(move |left| other.map(move |right| f(left, right)))
    }

    /// Blocks the calling thread. Only for shutdown paths and tests.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.inner.state.lock();
        if let State::Pending(_) = &*state {
            self.inner.done.wait_for(&mut state, timeout);
        }
        match &*state {
            State::Done(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }
}

impl<T, E> Completion<Result<T, E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Gathers every result in order, or the first failure to arrive.
    ///
    /// A failure resolves the aggregate immediately; later results are ignored.
    pub fn try_all(parts: Vec<Completion<Result<T, E>>>) -> Completion<Result<Vec<T>, E>> {
        let out = Completion::new();
        if parts.is_empty() {
            out.complete(Ok(vec![]));
            return out;
        }
        let slots = Arc::new(Mutex::new((vec![None; parts.len()], parts.len())));
        for (i, part) in parts.into_iter().enumerate() {
            let out = out.clone();
            let slots = slots.clone();
            part.on_complete(move |result| match result {
                Err(e) => {
                    out.complete(Err(e.clone()));
                }
                Ok(value) => {
                    let mut guard = slots.lock();
                    let (values, remaining) = &mut *guard;
                    values[i] = Some(value.clone());
                    *remaining -= 1;
                    if *remaining == 0 {
                        let values = values.iter_mut().filter_map(Option::take).collect();
                        drop(guard);
                        out.complete(Ok(values));
                    }
                }
            });
        }
        out
    }
}

fn forward<U: Clone + Send + 'static>(from: Completion<U>, to: Completion<U>) {
    from.on_complete(move |value| {
        to.complete(value.clone());
    });
}
