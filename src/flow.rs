//! Cancellable lazy flows
//!
//! A [`Flow`] is a cold, pull-based sequence: the producer does not start
//! until the first value is requested, and it hands values over one at a
//! time through a single slot. No buffering. The producer is suspended after
//! each emission until the collector has taken the value.
//!
//! Collecting consumes the `Flow`, so an instance runs at most once. Calling
//! the function that builds it again gives a fresh, independent run.
//!
//! Dropping or cancelling the [`FlowStream`] drops the producer. Values that
//! were already taken stay observed; nothing after that is produced, and an
//! `emit` from a surviving `Emitter` clone is silently discarded.

use futures::future::LocalBoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type Producer<T> = Box<dyn FnOnce(Emitter<T>) -> LocalBoxFuture<'static, ()>>;

/// Single-slot hand-off between producer and collector
struct Handoff<T> {
    slot: RefCell<Option<T>>,
    cancelled: Cell<bool>,
    /// Values put into the slot so far
    pushed: Cell<u64>,
    /// Values taken out of the slot so far
    taken: Cell<u64>,
    collector: RefCell<Option<Waker>>,
    /// Every emitter waiting on the slot; emitters may live in several tasks
    producers: RefCell<Vec<Waker>>,
}

impl<T> Handoff<T> {
    fn new() -> Self {
        Self {
            slot: RefCell::new(None),
            cancelled: Cell::new(false),
            pushed: Cell::new(0),
            taken: Cell::new(0),
            collector: RefCell::new(None),
            producers: RefCell::new(Vec::new()),
        }
    }

    /// Take the pending value and release the producers parked in other tasks
    fn take(&self, current: &Waker) -> Option<T> {
        let value = self.slot.borrow_mut().take()?;
        self.taken.set(self.taken.get() + 1);
        let producers = std::mem::take(&mut *self.producers.borrow_mut());
        for waker in producers {
            wake_other(Some(waker), current);
        }
        Some(value)
    }

    fn park_producer(&self, waker: &Waker) {
        let mut producers = self.producers.borrow_mut();
        if !producers.iter().any(|w| w.will_wake(waker)) {
            producers.push(waker.clone());
        }
    }

    fn park_collector(&self, waker: &Waker) {
        *self.collector.borrow_mut() = Some(waker.clone());
    }

    fn cancel(&self) {
        self.cancelled.set(true);
        drop(self.slot.borrow_mut().take());
        let producers = std::mem::take(&mut *self.producers.borrow_mut());
        for waker in producers {
            waker.wake();
        }
    }
}

/// Wake `waker` unless it belongs to the task that is already running
fn wake_other(waker: Option<Waker>, current: &Waker) {
    if let Some(waker) = waker
        && !waker.will_wake(current)
    {
        waker.wake();
    }
}

/// The producer's side of a flow
pub struct Emitter<T> {
    handoff: Rc<Handoff<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            handoff: self.handoff.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Hand `value` to the collector, suspending until it has been taken
    ///
    /// Resolves immediately, dropping the value, once the collector has stopped.
    pub fn emit(&self, value: T) -> Emit<T> {
        Emit {
            handoff: self.handoff.clone(),
            value: Some(value),
            ticket: 0,
        }
    }

    /// True once the collector has stopped collecting
    pub fn is_cancelled(&self) -> bool {
        self.handoff.cancelled.get()
    }
}

/// Future returned by [`Emitter::emit`]
pub struct Emit<T> {
    handoff: Rc<Handoff<T>>,
    value: Option<T>,
    ticket: u64,
}

// `value` is never pinned
impl<T> Unpin for Emit<T> {}

impl<T> Future for Emit<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let handoff = &this.handoff;

        if handoff.cancelled.get() {
            this.value = None;
            return Poll::Ready(());
        }

        if let Some(value) = this.value.take() {
            if handoff.slot.borrow().is_some() {
                // Someone else's value is still waiting
                this.value = Some(value);
                handoff.park_producer(cx.waker());
                return Poll::Pending;
            }
            *handoff.slot.borrow_mut() = Some(value);
            this.ticket = handoff.pushed.get() + 1;
            handoff.pushed.set(this.ticket);

            let collector = handoff.collector.borrow_mut().take();
            wake_other(collector, cx.waker());
            handoff.park_producer(cx.waker());
            return Poll::Pending;
        }

        if handoff.taken.get() >= this.ticket {
            Poll::Ready(())
        } else {
            handoff.park_producer(cx.waker());
            Poll::Pending
        }
    }
}

/// A cold, single-use lazy sequence
pub struct Flow<T> {
    producer: Producer<T>,
}

/// Build a flow whose values are whatever `producer` emits
///
/// The flow ends when `producer` returns; a producer that never returns
/// gives an infinite flow.
pub fn flow<T, F, Fut>(producer: F) -> Flow<T>
where
    T: 'static,
    F: FnOnce(Emitter<T>) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    Flow {
        producer: Box::new(move |emitter| producer(emitter).boxed_local()),
    }
}

/// A flow that emits every item of `values`
pub fn flow_of<T, I>(values: I) -> Flow<T>
where
    T: 'static,
    I: IntoIterator<Item = T> + 'static,
{
    flow(move |emitter| async move {
        for value in values {
            emitter.emit(value).await;
        }
    })
}

impl<T: 'static> Flow<T> {
    /// Same as [`flow`]
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Emitter<T>) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        flow(producer)
    }

    /// Start pulling values as a `Stream`
    pub fn into_stream(self) -> FlowStream<T> {
        FlowStream {
            state: State::Idle(self.producer),
            handoff: Rc::new(Handoff::new()),
        }
    }

    /// Call `on_value` for every value, in emission order
    pub async fn collect<F: FnMut(T)>(self, mut on_value: F) {
        let mut stream = self.into_stream();
        while let Some(value) = stream.next().await {
            on_value(value);
        }
    }

    /// Collect every value into a `Vec`
    pub async fn to_vec(self) -> Vec<T> {
        self.into_stream().collect().await
    }
}

enum State<T> {
    Idle(Producer<T>),
    Running(LocalBoxFuture<'static, ()>),
    Done,
}

/// An in-progress collection of a [`Flow`]
pub struct FlowStream<T> {
    state: State<T>,
    handoff: Rc<Handoff<T>>,
}

impl<T> FlowStream<T> {
    /// Stop collecting. The producer is dropped and never resumed.
    pub fn cancel(&mut self) {
        self.handoff.cancel();
        self.state = State::Done;
    }

    pub fn is_cancelled(&self) -> bool {
        self.handoff.cancelled.get()
    }

    /// Number of values delivered so far
    pub fn position(&self) -> u64 {
        self.handoff.taken.get()
    }
}

impl<T> Stream for FlowStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let handoff = this.handoff.clone();
        handoff.collector.borrow_mut().take();

        if handoff.cancelled.get() {
            return Poll::Ready(None);
        }
        if let Some(value) = handoff.take(cx.waker()) {
            return Poll::Ready(Some(value));
        }

        if let State::Idle(_) = this.state
            && let State::Idle(start) = std::mem::replace(&mut this.state, State::Done)
        {
            this.state = State::Running(start(Emitter {
                handoff: handoff.clone(),
            }));
        }

        let State::Running(producer) = &mut this.state else {
            return Poll::Ready(None);
        };

        match producer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.state = State::Done;
                Poll::Ready(handoff.take(cx.waker()))
            }
            Poll::Pending => match handoff.take(cx.waker()) {
                Some(value) => Poll::Ready(Some(value)),
                None => {
                    handoff.park_collector(cx.waker());
                    Poll::Pending
                }
            },
        }
    }
}

impl<T> Drop for FlowStream<T> {
    fn drop(&mut self) {
        self.handoff.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{coroutine_scope, delay, measure_time, run_blocking, with_timeout_or_null};
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// 1, 2, 3 with a 100ms pause before each
    fn simple(log: Rc<RefCell<Vec<String>>>) -> Flow<i32> {
        flow(move |emitter| async move {
            for i in 1..=3 {
                delay(ms(100)).await;
                log.borrow_mut().push(format!("Emitting {i}"));
                emitter.emit(i).await;
            }
        })
    }

    #[test]
    fn test_collects_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let producer_log = log.clone();

        let (values, elapsed) = run_blocking(|_| {
            measure_time(async move {
                let mut values = Vec::new();
                simple(producer_log).collect(|v| values.push(v)).await;
                values
            })
        })
        .unwrap();

        assert_eq!(values, vec![1, 2, 3]);
        assert!(elapsed >= ms(300));
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_timeout_keeps_prefix() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let producer_log = log.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();

        let result = run_blocking(|_| async move {
            with_timeout_or_null(ms(250), |_| async move {
                simple(producer_log).collect(|v| sink.borrow_mut().push(v)).await;
            })
            .await
        })
        .unwrap();

        assert_eq!(result, None);
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(*log.borrow(), vec!["Emitting 1", "Emitting 2"]);
    }

    #[test]
    fn test_producer_is_lazy() {
        let started = Rc::new(Cell::new(false));
        let flag = started.clone();

        run_blocking(|_| async move {
            let mut stream = flow(move |emitter| async move {
                flag.set(true);
                emitter.emit(1).await;
            })
            .into_stream();

            assert!(!started.get());
            assert_eq!(stream.next().await, Some(1));
            assert!(started.get());
            assert_eq!(stream.next().await, None);
        })
        .unwrap();
    }

    #[test]
    fn test_rebuilding_starts_fresh_run() {
        let starts = Rc::new(Cell::new(0));
        let counter = starts.clone();

        let runs = run_blocking(|_| async move {
            let numbers = move || {
                let counter = counter.clone();
                flow(move |emitter| async move {
                    counter.set(counter.get() + 1);
                    for i in 0..3 {
                        emitter.emit(i).await;
                    }
                })
            };
            (numbers().to_vec().await, numbers().to_vec().await)
        })
        .unwrap();

        assert_eq!(runs, (vec![0, 1, 2], vec![0, 1, 2]));
        assert_eq!(starts.get(), 2);
    }

    #[test]
    fn test_cancel_stops_producer() {
        let produced = Rc::new(Cell::new(0));
        let counter = produced.clone();

        run_blocking(|_| async move {
            let mut stream = flow(move |emitter| async move {
                loop {
                    counter.set(counter.get() + 1);
                    emitter.emit(counter.get()).await;
                }
            })
            .into_stream();

            assert_eq!(stream.next().await, Some(1));
            assert_eq!(stream.next().await, Some(2));
            stream.cancel();
            assert!(stream.is_cancelled());
            assert_eq!(stream.position(), 2);
            assert_eq!(stream.next().await, None);
        })
        .unwrap();

        assert_eq!(produced.get(), 2);
    }

    #[test]
    fn test_emit_after_stop_is_dropped() {
        struct Tracked(Rc<Cell<u32>>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let counter = drops.clone();

        run_blocking(|_| async move {
            let kept: Rc<RefCell<Option<Emitter<Tracked>>>> = Rc::new(RefCell::new(None));
            let stash = kept.clone();

            let mut stream = flow(move |emitter: Emitter<Tracked>| async move {
                *stash.borrow_mut() = Some(emitter.clone());
                futures::future::pending::<()>().await;
            })
            .into_stream();
            // Starts the producer, which parks forever
            let pull = futures::poll!(stream.next());
            assert!(pull.is_pending());
            drop(stream);

            let emitter = kept.borrow_mut().take().unwrap();
            assert!(emitter.is_cancelled());
            emitter.emit(Tracked(counter.clone())).await;
            assert_eq!(counter.get(), 1);
        })
        .unwrap();

        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_emit_from_child_tasks() {
        let values = run_blocking(|_| async {
            flow(|emitter| async move {
                coroutine_scope(|scope| async move {
                    for i in 0..3u64 {
                        let emitter = emitter.clone();
                        scope.launch(async move {
                            delay(ms(10 * (i + 1))).await;
                            emitter.emit(i).await;
                        });
                    }
                })
                .await;
            })
            .to_vec()
            .await
        })
        .unwrap();

        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn test_emitters_contending_in_same_tick() {
        let values = run_blocking(|_| async {
            flow(|emitter| async move {
                coroutine_scope(|scope| async move {
                    for i in 0..3u64 {
                        let emitter = emitter.clone();
                        scope.launch(async move {
                            delay(ms(10)).await;
                            emitter.emit(i).await;
                        });
                    }
                })
                .await;
            })
            .to_vec()
            .await
        })
        .unwrap();

        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn test_stream_combinators() {
        let values = run_blocking(|_| async {
            flow_of(1..=10)
                .into_stream()
                .filter(|n| futures::future::ready(n % 2 == 0))
                .map(|n| n * 10)
                .take(3)
                .collect::<Vec<_>>()
                .await
        })
        .unwrap();

        assert_eq!(values, vec![20, 40, 60]);
    }
}
