//! Shared rate budget: a `governor` limiter behind a strict FIFO wait queue.
//!
//! `governor` decides when a token is available (GCRA, burst up to the
//! configured capacity). The queue decides who gets it: a background task
//! hands each available token to the oldest live waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use governor::clock::Clock;
use governor::state::{InMemoryState, NotKeyed};
use governor::middleware::NoOpMiddleware;
use governor::{Quota, RateLimiter};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::RateLimitError;
use crate::config::RateConfig;

/// Reads tokio's clock so paused-time tests drive the limiter too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type Limiter = RateLimiter<
    NotKeyed,
    InMemoryState,
    TokioClock,
    NoOpMiddleware<<TokioClock as Clock>::Instant>,
>;

#[derive(Debug, Default)]
struct Queue {
    waiters: VecDeque<oneshot::Sender<()>>,
    granted: u64,
}

enum Step {
    Idle,
    Granted,
    Wait(Duration),
}

struct Shared {
    limiter: Limiter,
    clock: TokioClock,
    queue: Mutex<Queue>,
    wake: Notify,
}

impl Shared {
    /// Drop waiters that gave up, then try to serve the head of the queue.
    fn step(&self) -> Step {
        let mut queue = self.queue.lock().unwrap();
        queue.waiters.retain(|w| !w.is_closed());
        if queue.waiters.is_empty() {
            return Step::Idle;
        }
        match self.limiter.check() {
            Ok(()) => {
                if let Some(waiter) = queue.waiters.pop_front() {
                    if waiter.send(()).is_ok() {
                        queue.granted += 1;
                    }
                }
                Step::Granted
            }
            Err(not_until) => Step::Wait(not_until.wait_time_from(self.clock.now())),
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            match self.step() {
                Step::Granted => {}
                Step::Wait(wait) => tokio::time::sleep(wait).await,
                Step::Idle => self.wake.notified().await,
            }
        }
    }
}

/// Sustained rate and burst from config. Zero values are raised to one.
pub fn quota(config: &RateConfig) -> Quota {
    let rate = NonZeroU32::new(config.rate_per_sec).unwrap_or(NonZeroU32::MIN);
    let burst = config.burst.and_then(NonZeroU32::new).unwrap_or(rate);
    Quota::per_second(rate).allow_burst(burst)
}

/// Global ceiling on remote calls per unit of time.
///
/// Configured with a sustained rate (tokens/second) and a burst capacity.
/// Must be created inside a tokio runtime.
pub struct RateBudget {
    shared: Arc<Shared>,
    capacity: u32,
    interval: Duration,
    drain_task: JoinHandle<()>,
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBudget")
            .field("capacity", &self.capacity)
            .field("interval", &self.interval)
            .field("queued", &self.queued())
            .finish()
    }
}

impl RateBudget {
    pub fn new(config: &RateConfig) -> Self {
        let quota = quota(config);
        let capacity = quota.burst_size().get();
        let interval = quota.replenish_interval();
        let clock = TokioClock;

        let shared = Arc::new(Shared {
            limiter: RateLimiter::direct_with_clock(quota, clock),
            clock,
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
        });
        let drain_task = tokio::spawn(shared.clone().drain());

        debug!(
            rate = config.rate_per_sec,
            capacity,
            interval_us = interval.as_micros() as u64,
            "rate budget started"
        );

        Self {
            shared,
            capacity,
            interval,
            drain_task,
        }
    }

    /// Request one token.
    ///
    /// The request takes its place in the queue when this is called, not when
    /// the returned future is first polled, so call order is grant order.
    pub fn acquire(&self) -> Acquire {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.waiters.is_empty() && self.shared.limiter.check().is_ok() {
            queue.granted += 1;
            return Acquire { waiting: None };
        }
        let (tx, rx) = oneshot::channel();
        queue.waiters.push_back(tx);
        drop(queue);
        self.shared.wake.notify_one();
        Acquire { waiting: Some(rx) }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().waiters.len()
    }

    pub fn granted(&self) -> u64 {
        self.shared.queue.lock().unwrap().granted
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Time to earn back one token.
    pub fn refill_interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for RateBudget {
    fn drop(&mut self) {
        self.drain_task.abort();
        // Wake everyone still queued with `Closed`.
        self.shared.queue.lock().unwrap().waiters.clear();
    }
}

/// Future returned by [`RateBudget::acquire`].
#[derive(Debug)]
#[must_use = "a rate token is only granted once the future resolves"]
pub struct Acquire {
    waiting: Option<oneshot::Receiver<()>>,
}

impl Future for Acquire {
    type Output = Result<(), RateLimitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.waiting.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(rx) => Pin::new(rx).poll(cx).map(|res| res.map_err(|_| RateLimitError::Closed)),
        }
    }
}
