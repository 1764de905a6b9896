//! Form submission: one outstanding invoice request at a time.

use crate::backend::{Backend, BackendError};
use crate::model::{InvoiceRecord, InvoiceRequest};
use crate::storage::LocalStore;
use crate::tier::{Tier, TierGate};
use crate::validate::{self, ValidationError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

pub(crate) const IDLE_LABEL: &str = "Create Invoice";
pub(crate) const BUSY_LABEL: &str = "Processing...";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SubmitControl {
    pub(crate) enabled: bool,
    pub(crate) label: &'static str,
}

impl SubmitControl {
    pub(crate) fn idle() -> Self {
        Self {
            enabled: true,
            label: IDLE_LABEL,
        }
    }

    fn busy() -> Self {
        Self {
            enabled: false,
            label: BUSY_LABEL,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PurchaseForm {
    pub(crate) rgb_invoice: String,
    pub(crate) batch_count: u32,
    pub(crate) email: Option<String>,
}

#[derive(Debug, Error)]
pub(crate) enum PurchaseError {
    #[error("purchase tier locked")]
    TierLocked,
    #[error("invalid {}: {0}", .0.field())]
    Invalid(#[from] ValidationError),
    #[error("another request is in flight")]
    Busy,
    #[error("identical request submitted moments ago")]
    Duplicate,
    #[error("no response before the fail-safe timeout")]
    TimedOut,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl PurchaseError {
    /// Short text for the user. Backend wording is never passed through.
    pub(crate) fn user_message(&self) -> String {
        match self {
            PurchaseError::TierLocked => GAME_REQUIRED.to_string(),
            PurchaseError::Invalid(v) if v.is_invoice_format() => INVALID_INVOICE.to_string(),
            PurchaseError::Invalid(v) => format!("Please fix the {}: {v}.", field_name(v)),
            PurchaseError::Busy | PurchaseError::Duplicate => PLEASE_WAIT.to_string(),
            PurchaseError::TimedOut => GENERIC_FAILURE.to_string(),
            PurchaseError::Backend(e) => classify_backend(e).to_string(),
        }
    }
}

const GAME_REQUIRED: &str = "Complete the game to unlock purchasing.";
const INVALID_INVOICE: &str =
    "Invalid RGB invoice format. It should start with \"rgb:\" and come from your RGB wallet.";
const PLEASE_WAIT: &str = "Please wait, your request is being processed.";
const GENERIC_FAILURE: &str = "Could not create the invoice. Please try again.";

fn field_name(v: &ValidationError) -> &'static str {
    match v.field() {
        "batchCount" => "batch count",
        "email" => "email address",
        _ => "invoice",
    }
}

fn classify_backend(e: &BackendError) -> &'static str {
    match e {
        BackendError::Rejected { status, message } => {
            let m = message.to_ascii_lowercase();
            if m.contains("invoice") && (m.contains("format") || m.contains("invalid")) {
                INVALID_INVOICE
            } else if *status == 403 || m.contains("tier") || m.contains("game") {
                GAME_REQUIRED
            } else if *status == 429 {
                PLEASE_WAIT
            } else {
                GENERIC_FAILURE
            }
        }
        _ => GENERIC_FAILURE,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Fingerprint {
    invoice: String,
    batches: u32,
    tier: Tier,
}

#[derive(Default)]
struct Flight {
    in_flight: bool,
    recent: Vec<(Fingerprint, Instant)>,
}

pub(crate) struct InvoiceRequester {
    backend: Arc<dyn Backend>,
    gate: Arc<TierGate>,
    store: Arc<LocalStore>,
    debounce: Duration,
    failsafe: Duration,
    flight: Mutex<Flight>,
    control: watch::Sender<SubmitControl>,
}

impl InvoiceRequester {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        gate: Arc<TierGate>,
        store: Arc<LocalStore>,
        debounce: Duration,
        failsafe: Duration,
    ) -> Self {
        let (control, _rx) = watch::channel(SubmitControl::idle());
        Self {
            backend,
            gate,
            store,
            debounce,
            failsafe,
            flight: Mutex::new(Flight::default()),
            control,
        }
    }

    pub(crate) fn control(&self) -> watch::Receiver<SubmitControl> {
        self.control.subscribe()
    }

    pub(crate) async fn submit(&self, form: &PurchaseForm) -> Result<InvoiceRecord, PurchaseError> {
        let tier = self.gate.current();
        if !tier.unlocked() {
            tracing::warn!(score = tier.score, "submission while tier locked");
            return Err(PurchaseError::TierLocked);
        }
        let invoice = validate::rgb_invoice(&form.rgb_invoice)?.to_string();
        let batch_count = validate::batch_count(form.batch_count, &tier)?;
        let email = validate::email(form.email.as_deref())?;

        let fp = Fingerprint {
            invoice: invoice.clone(),
            batches: batch_count,
            tier: tier.tier,
        };
        let _flight = self.claim(fp)?;

        let req = InvoiceRequest {
            rgb_invoice: invoice,
            batch_count,
            tier_label: tier.tier.label().to_string(),
            email,
            game_session_id: self.store.snapshot().game_session_id,
        };
        tracing::info!(batches = batch_count, tier = %tier.tier, "creating invoice");

        let pending = self.backend.create_invoice(&req);
        let result = match tokio::time::timeout(self.failsafe, pending).await {
            Ok(r) => r.map_err(PurchaseError::from),
            Err(_) => Err(PurchaseError::TimedOut),
        };

        match &result {
            Ok(rec) => {
                tracing::info!(
                    invoice_id = %rec.invoice_id,
                    amount_sats = rec.amount_sats,
                    "invoice created"
                );
                let id = rec.invoice_id.clone();
                if let Err(e) = self.store.update(|s| s.last_invoice_id = Some(id)) {
                    tracing::warn!(error = %e, "could not remember invoice id");
                }
            }
            Err(e) => tracing::warn!(error = %e, "invoice creation failed"),
        }
        result
    }

    /// Take the in-flight slot, or explain why not. The returned guard gives
    /// it back and restores the submit control however the request ends.
    fn claim(&self, fp: Fingerprint) -> Result<FlightGuard<'_>, PurchaseError> {
        let mut flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        if flight.in_flight {
            return Err(PurchaseError::Busy);
        }
        let now = Instant::now();
        flight
            .recent
            .retain(|(_, at)| now.saturating_duration_since(*at) < self.debounce);
        if flight.recent.iter().any(|(f, _)| *f == fp) {
            tracing::debug!("debounced duplicate submission");
            return Err(PurchaseError::Duplicate);
        }
        flight.in_flight = true;
        self.control.send_replace(SubmitControl::busy());
        Ok(FlightGuard { owner: self, fp })
    }
}

struct FlightGuard<'a> {
    owner: &'a InvoiceRequester,
    fp: Fingerprint,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flight = self.owner.flight.lock().unwrap_or_else(|e| e.into_inner());
        flight.in_flight = false;
        flight.recent.push((self.fp.clone(), Instant::now()));
        drop(flight);
        self.owner.control.send_replace(SubmitControl::idle());
    }
}
