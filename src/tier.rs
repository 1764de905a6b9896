//! Score-backed purchase tiers.
//!
//! The score comes from the local store and, redundantly, from a launch link
//! (`...?score=25` or `...#score=25`). Neither is a security boundary; the
//! backend re-checks eligibility when the invoice is created.

use crate::storage::LocalStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Tier {
    None,
    Bronze,
    Silver,
    Gold,
}

/// Minimum score per tier, highest first.
const TIER_TABLE: [(u32, Tier); 3] = [(25, Tier::Gold), (15, Tier::Silver), (11, Tier::Bronze)];

impl Tier {
    pub(crate) fn max_batches(self) -> u32 {
        match self {
            Tier::None => 0,
            Tier::Bronze => 10,
            Tier::Silver => 20,
            Tier::Gold => 30,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
        }
    }

    pub(crate) fn min_score(self) -> u32 {
        TIER_TABLE
            .iter()
            .find(|(_, t)| *t == self)
            .map(|(s, _)| *s)
            .unwrap_or(0)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TierState {
    pub(crate) score: u32,
    pub(crate) tier: Tier,
    pub(crate) max_batches: u32,
}

impl TierState {
    pub(crate) fn unlocked(&self) -> bool {
        self.tier != Tier::None
    }
}

pub(crate) fn tier_of(score: u32) -> TierState {
    let tier = TIER_TABLE
        .iter()
        .find(|(min, _)| score >= *min)
        .map(|(_, t)| *t)
        .unwrap_or(Tier::None);
    TierState {
        score,
        tier,
        max_batches: tier.max_batches(),
    }
}

/// Clamp a form's batch count into what the tier allows. Locked tiers get 0.
pub(crate) fn clamp_batches(requested: u32, state: &TierState) -> u32 {
    if !state.unlocked() {
        return 0;
    }
    requested.clamp(1, state.max_batches)
}

/// Lenient score parse: integers, numeric strings, and non-negative floats
/// (truncated). Everything else is 0.
pub(crate) fn parse_score(raw: Option<&Value>) -> u32 {
    match raw {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u.min(u32::MAX as u64) as u32
            } else {
                n.as_f64().map(score_from_f64).unwrap_or(0)
            }
        }
        Some(Value::String(s)) => parse_score_str(s),
        _ => 0,
    }
}

fn parse_score_str(s: &str) -> u32 {
    let s = s.trim();
    if let Ok(u) = s.parse::<u32>() {
        return u;
    }
    s.parse::<f64>().map(score_from_f64).unwrap_or(0)
}

fn score_from_f64(f: f64) -> u32 {
    if f.is_finite() && f >= 0.0 {
        f.min(u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Score carried by a launch link, looked up in both the query string and the
/// fragment. Returns 0 if the link has none.
pub(crate) fn link_score(link: &str) -> u32 {
    let mut best = 0;
    for part in [link.split_once('?'), link.split_once('#')]
        .into_iter()
        .flatten()
        .map(|(_, rest)| rest)
    {
        // A query may still be followed by a fragment.
        let part = part.split('#').next().unwrap_or("");
        for pair in part.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k.trim() == "score" {
                    best = best.max(parse_score_str(v));
                }
            }
        }
    }
    best
}

/// Decides purchase eligibility and publishes every change to subscribers.
pub(crate) struct TierGate {
    store: Arc<LocalStore>,
    link: Mutex<Option<String>>,
    tx: watch::Sender<TierState>,
}

impl TierGate {
    pub(crate) fn new(store: Arc<LocalStore>, link: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(tier_of(0));
        let gate = Self {
            store,
            link: Mutex::new(link),
            tx,
        };
        if let Err(e) = gate.refresh() {
            tracing::warn!(error = %e, "could not sync tier label on load");
        }
        gate
    }

    pub(crate) fn current(&self) -> TierState {
        *self.tx.borrow()
    }

    pub(crate) fn purchase_allowed(&self) -> bool {
        self.current().unlocked()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TierState> {
        self.tx.subscribe()
    }

    /// Recompute from the store and link. Rewrites the persisted tier label
    /// when it disagrees with the score; the state is published either way.
    pub(crate) fn refresh(&self) -> Result<TierState> {
        let snap = self.store.snapshot();
        let stored = parse_score(snap.score.as_ref());
        let from_link = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .map(link_score)
            .unwrap_or(0);
        let next = tier_of(stored.max(from_link));

        let changed = self.tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            *cur = next;
            true
        });
        if changed {
            tracing::info!(
                score = next.score,
                tier = %next.tier,
                max_batches = next.max_batches,
                "tier updated"
            );
        }

        let want = next.unlocked().then(|| next.tier.label().to_string());
        if snap.tier != want {
            tracing::debug!(stored = ?snap.tier, want = ?want, "syncing tier label");
            self.store.update(|s| s.tier = want)?;
        }
        Ok(next)
    }

    pub(crate) fn on_storage_change(&self) -> Result<TierState> {
        self.store.reload();
        self.refresh()
    }

    pub(crate) fn on_link_change(&self, link: Option<String>) -> Result<TierState> {
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = link;
        self.refresh()
    }
}
