//! The sampling loop and the mail relay, written against traits so they run
//! unchanged on the board and in tests.
//!
//! The monitor lives behind a blocking mutex. Only the sensor read is
//! awaited outside of it; everything a tick mutates is updated within a
//! single `lock` call, so readers on the same executor never observe half a
//! tick.

use core::cell::RefCell;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Receiver;
use embassy_sync::signal::Signal;

use crate::fmt::{debug, info};
use crate::monitor::{Monitor, TickReport};
use crate::notification::{DeliveryOutcome, Envelope, Mailer, Outbox, deliver};
use crate::sensor::SensorReader;
use crate::timestamp::Timestamp;

pub type SharedMonitor<M> = Mutex<M, RefCell<Monitor>>;

pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Source of tick times.
#[allow(async_fn_in_trait)]
pub trait TickSource {
    /// Wait until the next tick is due and return its time.
    async fn next_tick(&mut self, interval_seconds: u32) -> Timestamp;
}

pub struct Scheduler<'a, M: RawMutex, S, O> {
    monitor: &'a SharedMonitor<M>,
    sensor: S,
    outbox: O,
}

impl<'a, M, S, O> Scheduler<'a, M, S, O>
where
    M: RawMutex,
    S: SensorReader,
    O: Outbox,
{
    pub fn new(monitor: &'a SharedMonitor<M>, sensor: S, outbox: O) -> Self {
        Self { monitor, sensor, outbox }
    }

    /// One full tick at `now`.
    pub async fn tick(&mut self, now: Timestamp) -> TickReport {
        let sample = self.sensor.sample(now).await;
        let outbox = &mut self.outbox;
        self.monitor.lock(|cell| cell.borrow_mut().tick(sample, outbox))
    }

    /// Tick until `stop` is signalled. A tick that has started always runs to
    /// completion; the stop request is honoured between ticks. Returns the
    /// number of ticks run.
    pub async fn run<SM: RawMutex>(&mut self, source: &mut impl TickSource, stop: &Signal<SM, ()>) -> u32 {
        info!("sampling loop started");
        let mut ticks: u32 = 0;
        while !stop.signaled() {
            let interval = self.monitor.lock(|cell| cell.borrow().settings().sample_interval_seconds);
            match select(source.next_tick(interval), stop.wait()).await {
                Either::First(now) => {
                    let report = self.tick(now).await;
                    debug!("tick {} done, {} transitions", ticks, report.transitions.len());
                    ticks = ticks.wrapping_add(1);
                }
                Either::Second(()) => break,
            }
        }
        info!("sampling loop stopped after {} ticks", ticks);
        ticks
    }
}

/// Moves envelopes from the outbox channel to the mail transport and files
/// the outcome in the monitor's notification log.
pub struct MailRelay<'a, M: RawMutex, CM: RawMutex, T, const N: usize> {
    monitor: &'a SharedMonitor<M>,
    inbox: Receiver<'a, CM, Envelope, N>,
    mailer: T,
}

impl<'a, M, CM, T, const N: usize> MailRelay<'a, M, CM, T, N>
where
    M: RawMutex,
    CM: RawMutex,
    T: Mailer,
{
    pub fn new(monitor: &'a SharedMonitor<M>, inbox: Receiver<'a, CM, Envelope, N>, mailer: T) -> Self {
        Self { monitor, inbox, mailer }
    }

    /// Wait for one envelope and try to deliver it.
    pub async fn relay_one(&mut self, clock: &impl Clock) -> DeliveryOutcome {
        let envelope = self.inbox.receive().await;
        let outcome = deliver(&mut self.mailer, &envelope).await;
        let kind = envelope.kind;
        let at = clock.now();
        self.monitor
            .lock(|cell| cell.borrow_mut().record_delivery(kind, outcome, at));
        outcome
    }
}
