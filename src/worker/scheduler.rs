//! Poll scheduler — periodic, concurrent polling of every active account.
//!
//! `Idle -> Running -> Stopped`. `start()` runs one pass before returning and
//! then ticks in the background; `stop()` signals the ticking loop and
//! returns at once. Poll tasks already spawned run to completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, SchedulerError};
use crate::model::Account;
use crate::pipeline::{ProcessOutcome, Router};
use crate::store::Directory;
use crate::transport::{Transport, TransportDeps};
use crate::worker::guard::{InFlight, InFlightGuard};

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Counts for one account's poll task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub forwarded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Messages whose outcome could not be read or written.
    pub store_errors: usize,
}

/// Result of one finished poll task.
#[derive(Debug)]
pub struct PollResult {
    pub account_id: i64,
    pub result: Result<PollReport, Error>,
}

struct Inner {
    directory: Arc<dyn Directory>,
    router: Arc<Router>,
    deps: TransportDeps,
    interval: Duration,
    state: Mutex<SchedulerState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: AsyncMutex<JoinSet<PollResult>>,
    in_flight: InFlight,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Shortest accepted poll interval. `tokio::time::interval` panics on zero.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Drives poll passes over all active accounts.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        directory: Arc<dyn Directory>,
        router: Arc<Router>,
        deps: TransportDeps,
        interval: Duration,
    ) -> Self {
        let interval = if interval < MIN_INTERVAL {
            warn!(?interval, min = ?MIN_INTERVAL, "Poll interval too short, clamping");
            MIN_INTERVAL
        } else {
            interval
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                directory,
                router,
                deps,
                interval,
                state: Mutex::new(SchedulerState::Idle),
                stop_tx,
                stop_rx,
                tasks: AsyncMutex::new(JoinSet::new()),
                in_flight: InFlight::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.lock_state()
    }

    /// Accounts with a poll task currently running.
    pub fn in_flight(&self) -> &InFlight {
        &self.inner.in_flight
    }

    /// Run one pass now, then keep polling every interval until stopped.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.lock_state();
            match *state {
                SchedulerState::Idle => *state = SchedulerState::Running,
                SchedulerState::Running => return Err(SchedulerError::AlreadyRunning),
                SchedulerState::Stopped => return Err(SchedulerError::Stopped),
            }
        }

        info!(interval = ?self.inner.interval, "Scheduler started");
        self.inner.run_pass().await;

        let inner = Arc::clone(&self.inner);
        let mut stop_rx = self.inner.stop_rx.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; that pass already ran.
            tick.tick().await;

            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tick.tick() => {
                        if !*stop_rx.borrow() {
                            inner.run_pass().await;
                        }
                    }
                }
            }
            info!("Scheduler loop stopped");
        });

        if let Ok(mut ticker) = self.inner.ticker.lock() {
            *ticker = Some(handle);
        }
        Ok(())
    }

    /// Signal the ticking loop to exit. Does not wait for running poll tasks.
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        if *state == SchedulerState::Stopped {
            return;
        }
        *state = SchedulerState::Stopped;
        drop(state);
        self.inner.stop_tx.send_replace(true);
        info!("Scheduler stop requested");
    }

    /// Wait for every poll task spawned so far.
    ///
    /// After `stop()`, this also waits for the ticking loop, so no task can
    /// be spawned once it returns.
    pub async fn join_in_flight(&self) -> Vec<PollResult> {
        if self.state() == SchedulerState::Stopped {
            let ticker = self.inner.ticker.lock().ok().and_then(|mut t| t.take());
            if let Some(handle) = ticker {
                if let Err(e) = handle.await {
                    error!(error = %e, "Scheduler loop panicked");
                }
            }
        }

        // Take the set so the lock is not held across the awaits below and
        // a pass running concurrently can still spawn.
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Poll task panicked"),
            }
        }
        results
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enumerate active accounts and spawn one poll task per account.
    /// Returns how many tasks were spawned.
    async fn run_pass(&self) -> usize {
        if *self.lock_state() == SchedulerState::Stopped {
            return 0;
        }

        let accounts = match self.directory.list_active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "Failed to load active accounts");
                return 0;
            }
        };

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Poll task panicked");
            }
        }

        let mut spawned = 0;
        for account in accounts {
            let Some(guard) = self.in_flight.try_acquire(account.id) else {
                warn!(
                    account_id = account.id,
                    address = %account.address,
                    "Previous poll still running, skipping account this pass"
                );
                continue;
            };
            let deps = self.deps.clone();
            let router = Arc::clone(&self.router);
            tasks.spawn(poll_task(account, deps, router, guard));
            spawned += 1;
        }

        debug!(spawned, "Poll pass dispatched");
        spawned
    }
}

async fn poll_task(
    account: Account,
    deps: TransportDeps,
    router: Arc<Router>,
    _guard: InFlightGuard,
) -> PollResult {
    let result = poll_account(&account, deps, &router).await;
    match &result {
        Ok(report) => info!(
            account_id = account.id,
            address = %account.address,
            fetched = report.fetched,
            forwarded = report.forwarded,
            failed = report.failed,
            skipped = report.skipped,
            store_errors = report.store_errors,
            "Poll finished"
        ),
        Err(e) => error!(
            account_id = account.id,
            address = %account.address,
            error = %e,
            "Poll failed"
        ),
    }
    PollResult {
        account_id: account.id,
        result,
    }
}

/// Connect, fetch, route each message in order, then always close.
pub async fn poll_account(
    account: &Account,
    deps: TransportDeps,
    router: &Router,
) -> Result<PollReport, Error> {
    let mut transport = Transport::new(account, deps)?;
    let result = fetch_and_route(account, &mut transport, router).await;
    if let Err(e) = transport.close().await {
        warn!(account_id = account.id, error = %e, "Failed to close mailbox session");
    }
    result
}

async fn fetch_and_route(
    account: &Account,
    transport: &mut Transport,
    router: &Router,
) -> Result<PollReport, Error> {
    let messages = transport.fetch_new().await?;
    let mut report = PollReport {
        fetched: messages.len(),
        ..Default::default()
    };

    for message in &messages {
        match router.process(message, account.id, &*transport).await {
            Ok(ProcessOutcome::Forwarded { .. }) => report.forwarded += 1,
            Ok(ProcessOutcome::Failed { .. }) => report.failed += 1,
            Ok(ProcessOutcome::Skipped) => report.skipped += 1,
            Err(e) => {
                error!(
                    account_id = account.id,
                    message_id = %message.message_id,
                    error = %e,
                    "Could not record outcome"
                );
                report.store_errors += 1;
            }
        }
    }
    Ok(report)
}
