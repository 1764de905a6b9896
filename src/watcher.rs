//! Watches one invoice until it settles.
//!
//! Two timers run per watcher: a status poll and a one-second countdown.
//! Both handles live in the watcher and are released together, either when
//! the invoice settles, when the countdown runs out, or on `close()`.

use crate::backend::{Backend, BackendError};
use crate::model::{InvoiceRecord, InvoiceStatus};
use anyhow::{bail, Context};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WatchState {
    pub(crate) status: InvoiceStatus,
    pub(crate) remaining: Duration,
    pub(crate) last_error: Option<String>,
    /// False once both timers have been released.
    pub(crate) active: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WatchConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) ceiling: Duration,
}

/// The only moves the state machine allows. Terminal states stick, except
/// that a paid invoice becomes delivered once its consignment is in hand.
pub(crate) fn next_status(cur: InvoiceStatus, reported: InvoiceStatus) -> Option<InvoiceStatus> {
    use crate::model::InvoiceStatus::*;
    match (cur, reported) {
        (Pending, Pending) => None,
        (Pending, next) => Some(next),
        (Paid, Delivered) => Some(Delivered),
        _ => None,
    }
}

#[derive(Default)]
struct Timers {
    closed: bool,
    poll: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

struct Shared {
    invoice_id: String,
    backend: Arc<dyn Backend>,
    state: watch::Sender<WatchState>,
    timers: Mutex<Timers>,
    consignment: OnceCell<Vec<u8>>,
    saved: OnceCell<PathBuf>,
}

impl Shared {
    fn new(invoice_id: String, backend: Arc<dyn Backend>, initial: WatchState) -> Self {
        let (state, _rx) = watch::channel(initial);
        Self {
            invoice_id,
            backend,
            state,
            timers: Mutex::new(Timers::default()),
            consignment: OnceCell::new(),
            saved: OnceCell::new(),
        }
    }

    fn status(&self) -> InvoiceStatus {
        self.state.borrow().status
    }

    fn transition(&self, reported: InvoiceStatus) -> bool {
        let changed = self.state.send_if_modified(|s| match next_status(s.status, reported) {
            Some(next) => {
                s.status = next;
                true
            }
            None => false,
        });
        if changed {
            tracing::info!(
                invoice_id = %self.invoice_id,
                status = %reported,
                "invoice status changed"
            );
        }
        changed
    }

    fn set_error(&self, err: Option<String>) {
        self.state.send_if_modified(|s| {
            if s.last_error == err {
                return false;
            }
            s.last_error = err;
            true
        });
    }

    /// Abort both timers. Safe to call any number of times, from anywhere,
    /// including from inside one of the timer tasks.
    fn release(&self) {
        let mut t = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let first = !t.closed;
        t.closed = true;
        for handle in [t.poll.take(), t.countdown.take()].into_iter().flatten() {
            handle.abort();
        }
        drop(t);
        if first {
            tracing::debug!(invoice_id = %self.invoice_id, "watch timers released");
        }
        self.state.send_if_modified(|s| std::mem::replace(&mut s.active, false));
    }

    async fn consignment(&self) -> Result<&Vec<u8>, BackendError> {
        self.consignment
            .get_or_try_init(|| async {
                tracing::info!(invoice_id = %self.invoice_id, "fetching consignment");
                self.backend.fetch_consignment(&self.invoice_id).await
            })
            .await
    }

    /// Fetch the consignment for a paid invoice and mark it delivered.
    async fn deliver(&self) -> Result<(), BackendError> {
        self.consignment().await?;
        self.transition(InvoiceStatus::Delivered);
        Ok(())
    }
}

pub(crate) struct PaymentWatcher {
    record: InvoiceRecord,
    shared: Arc<Shared>,
}

impl PaymentWatcher {
    pub(crate) fn start(
        backend: Arc<dyn Backend>,
        record: InvoiceRecord,
        cfg: WatchConfig,
    ) -> Self {
        let lifetime = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(cfg.ceiling);
        let deadline = Instant::now() + lifetime;
        let shared = Arc::new(Shared::new(
            record.invoice_id.clone(),
            backend,
            WatchState {
                status: record.status,
                remaining: lifetime,
                last_error: None,
                active: true,
            },
        ));

        tracing::info!(
            invoice_id = %record.invoice_id,
            amount_sats = record.amount_sats,
            lifetime_secs = lifetime.as_secs(),
            "watching invoice"
        );

        {
            // Spawn under the lock so a task that settles immediately cannot
            // release before both handles are stored.
            let mut t = shared.timers.lock().unwrap_or_else(|e| e.into_inner());
            t.poll = Some(tokio::spawn(poll_loop(
                shared.clone(),
                cfg.poll_interval,
                deadline,
            )));
            t.countdown = Some(tokio::spawn(countdown(shared.clone(), deadline)));
        }

        Self { record, shared }
    }

    pub(crate) fn record(&self) -> &InvoiceRecord {
        &self.record
    }

    pub(crate) fn state(&self) -> WatchState {
        self.shared.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.shared.state.subscribe()
    }

    /// Resolves once both timers are released and returns the final state.
    pub(crate) async fn finished(&self) -> WatchState {
        let mut rx = self.shared.state.subscribe();
        let done = rx.wait_for(|s| !s.active).await.map(|s| s.clone());
        done.unwrap_or_else(|_| self.state())
    }

    /// Stop watching. Idempotent.
    pub(crate) fn close(&self) {
        self.shared.release();
    }

    /// Save the consignment under `dir`. The file is fetched and written
    /// once per session; later calls return the same path.
    pub(crate) async fn download(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        if !matches!(
            self.shared.status(),
            InvoiceStatus::Paid | InvoiceStatus::Delivered
        ) {
            bail!("consignment is only available after payment");
        }
        let path = self
            .shared
            .saved
            .get_or_try_init(|| async {
                self.shared
                    .deliver()
                    .await
                    .context("could not fetch consignment")?;
                let bytes = self.shared.consignment().await?;
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("could not create {}", dir.display()))?;
                let path = dir.join(consignment_file_name(&self.record.invoice_id));
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("could not write {}", path.display()))?;
                tracing::info!(path = %path.display(), bytes = bytes.len(), "consignment saved");
                Ok::<_, anyhow::Error>(path)
            })
            .await?;
        Ok(path.clone())
    }
}

impl Drop for PaymentWatcher {
    fn drop(&mut self) {
        self.shared.release();
    }
}

fn consignment_file_name(invoice_id: &str) -> String {
    let safe: String = invoice_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("lightcat-{safe}.rgb")
}

/// Chained polling: the next request is only issued after the previous one
/// settles, so there is never more than one outstanding per invoice.
async fn poll_loop(shared: Arc<Shared>, every: Duration, deadline: Instant) {
    let mut tick = tokio::time::interval_at(Instant::now() + every, every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if shared.status().is_terminal() {
            break;
        }
        if Instant::now() >= deadline {
            shared.transition(InvoiceStatus::Expired);
            break;
        }
        let polled = shared.backend.invoice_status(&shared.invoice_id).await;
        apply_poll(&shared, polled).await;
        if shared.status().is_terminal() {
            break;
        }
    }
    shared.release();
}

/// Fold one poll result into the state. The consignment is only fetched by
/// the poll that moved the invoice to paid; a late "paid" after local expiry
/// changes nothing.
async fn apply_poll(shared: &Shared, polled: Result<InvoiceStatus, BackendError>) {
    let reported = match polled {
        Ok(reported) => reported,
        Err(e) => {
            tracing::warn!(
                invoice_id = %shared.invoice_id,
                error = %e,
                "status poll failed, retrying"
            );
            shared.set_error(Some(e.to_string()));
            return;
        }
    };
    tracing::debug!(invoice_id = %shared.invoice_id, status = %reported, "poll");
    shared.set_error(None);
    if !matches!(reported, InvoiceStatus::Paid | InvoiceStatus::Delivered) {
        shared.transition(reported);
        return;
    }
    if !shared.transition(InvoiceStatus::Paid) {
        return;
    }
    if let Err(e) = shared.deliver().await {
        // Still paid; `download` fetches on demand.
        tracing::warn!(invoice_id = %shared.invoice_id, error = %e, "consignment not ready");
        shared.set_error(Some(e.to_string()));
    }
}

async fn countdown(shared: Arc<Shared>, deadline: Instant) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let left = deadline.saturating_duration_since(Instant::now());
        shared.state.send_if_modified(|s| {
            if s.remaining == left {
                return false;
            }
            s.remaining = left;
            true
        });
        if shared.status().is_terminal() {
            // The poll task owns the exit path for settled invoices.
            return;
        }
        if left.is_zero() {
            if shared.transition(InvoiceStatus::Expired) {
                tracing::info!(invoice_id = %shared.invoice_id, "invoice expired locally");
                shared.release();
            }
            return;
        }
    }
}

/// `mm:ss` for the countdown line.
pub(crate) fn format_remaining(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
