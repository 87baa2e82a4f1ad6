//! Bot runner: schedules weekly state machine ticks for every account.
//!
//! Handles:
//! - One task per account, ticking on a fixed interval
//! - A per-account single-flight guard so ticks never overlap
//! - A per-tick timeout and a single catch point for tick errors
//! - Graceful shutdown through a cancellation token (Ctrl+C)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::api::{Broker, PaperBroker, SignalClient, SignalFeed};
use crate::db::{PaperLedger, StateStore};
use crate::trading::{
    AccountConfig, EngineConfig, Reconciler, SystemClock, TickOutcome,
    WeeklyStateMachine,
};

/// Source of tick events for one account.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. Returns `false` once no more ticks will come.
    async fn tick(&mut self) -> bool;
}

/// Wall-clock ticker. Ticks missed while a tick was slow are skipped, not bunched.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker fired by hand through a channel. Ends when every sender is dropped.
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

impl ManualTicker {
    pub fn channel(buffer: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Held while a tick runs; releases the account's flag when dropped,
/// including during a panic unwind.
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs ticks for a single account.
pub struct AccountRunner {
    machine: Arc<WeeklyStateMachine>,
    running: AtomicBool,
    tick_timeout: Duration,
}

impl AccountRunner {
    pub fn new(machine: WeeklyStateMachine, tick_timeout: Duration) -> Self {
        Self {
            machine: Arc::new(machine),
            running: AtomicBool::new(false),
            tick_timeout,
        }
    }

    pub fn bot_id(&self) -> &str {
        self.machine.bot_id()
    }

    pub fn is_ticking(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one guarded tick. Never fails: errors and timeouts are logged here
    /// and the next tick simply tries again.
    ///
    /// Returns `None` when the tick was skipped, failed or timed out.
    pub async fn run_tick(&self) -> Option<TickOutcome> {
        let Some(_guard) = TickGuard::acquire(&self.running) else {
            debug!(bot_id = %self.bot_id(), "Previous tick still running, skipping");
            return None;
        };

        let span = info_span!("tick", bot_id = %self.bot_id());
        async {
            match tokio::time::timeout(self.tick_timeout, self.machine.tick()).await {
                Ok(Ok(outcome)) => {
                    debug!(%outcome, "Tick complete");
                    Some(outcome)
                }
                Ok(Err(e)) => {
                    error!("Tick failed: {:#}", e);
                    None
                }
                Err(_) => {
                    error!(
                        timeout_secs = self.tick_timeout.as_secs_f64(),
                        "Tick timed out"
                    );
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Tick on every `ticker` event until it ends or `cancel` fires.
    ///
    /// Each tick runs in its own task so a slow tick cannot delay the ticker;
    /// the guard turns overlapping ticks into skips. In-flight ticks are
    /// awaited before returning.
    pub async fn run<T: Ticker>(self: Arc<Self>, mut ticker: T, cancel: CancellationToken) {
        info!(bot_id = %self.bot_id(), "Account runner started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                fired = ticker.tick() => {
                    if !fired {
                        break;
                    }
                    let runner = Arc::clone(&self);
                    in_flight.spawn(async move {
                        runner.run_tick().await;
                    });
                }
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done {
                        error!(bot_id = %self.bot_id(), "Tick task aborted: {}", e);
                    }
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(bot_id = %self.bot_id(), "Tick task aborted: {}", e);
            }
        }
        info!(bot_id = %self.bot_id(), "Account runner stopped");
    }
}

/// Runs every configured account until shutdown.
pub struct Scheduler {
    runners: Vec<Arc<AccountRunner>>,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            runners: Vec::new(),
            tick_interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn add(&mut self, machine: WeeklyStateMachine, tick_timeout: Duration) {
        self.runners
            .push(Arc::new(AccountRunner::new(machine, tick_timeout)));
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        if self.runners.is_empty() {
            bail!("No accounts to run");
        }

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("Shutdown signal received");
                        cancel.cancel();
                    }
                    Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
                },
                _ = cancel.cancelled() => {}
            }
        });

        info!(
            accounts = self.runners.len(),
            tick_secs = self.tick_interval.as_secs(),
            "Starting scheduler"
        );

        let mut tasks = JoinSet::new();
        for runner in self.runners {
            let ticker = IntervalTicker::new(self.tick_interval);
            tasks.spawn(runner.run(ticker, self.cancel.child_token()));
        }
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Account runner aborted: {}", e);
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

/// Broker and signal feed wired up for one account.
pub struct AccountServices {
    pub config: AccountConfig,
    pub broker: Arc<dyn Broker>,
    pub feed: Arc<dyn SignalFeed>,
}

impl AccountServices {
    /// Build clients from the environment. Missing settings are fatal.
    pub fn connect(
        engine: &EngineConfig,
        config: AccountConfig,
        ledger: Arc<dyn PaperLedger>,
    ) -> Result<Self> {
        let feed = SignalClient::new(engine.require_app_base_url()?, engine.request_timeout())?;
        let broker = build_broker(engine, ledger, &config.bot_id)
            .with_context(|| format!("Failed to configure broker for {}", config.bot_id))?;
        info!(
            bot_id = %config.bot_id,
            broker = broker.name(),
            trading_enabled = config.trading_enabled,
            "Account configured"
        );

        Ok(Self {
            config,
            broker,
            feed: Arc::new(feed),
        })
    }

    pub fn machine(&self, store: Arc<dyn StateStore>) -> WeeklyStateMachine {
        WeeklyStateMachine::new(
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.feed),
            store,
            Arc::new(SystemClock),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.feed),
        )
    }
}

/// Paper account priced from the configured market file, its book kept in `ledger`.
fn build_broker(
    engine: &EngineConfig,
    ledger: Arc<dyn PaperLedger>,
    bot_id: &str,
) -> Result<Arc<dyn Broker>> {
    let market_file = engine.require_market_file()?;
    Ok(Arc::new(
        PaperBroker::new(engine.paper_balance)
            .with_market_file(market_file)
            .with_ledger(ledger, bot_id),
    ))
}
