use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
    Delivered,
    Failed,
}

impl InvoiceStatus {
    /// Anything past `Pending` stops polling.
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }

    pub(crate) fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "expired" => Some(InvoiceStatus::Expired),
            "delivered" => Some(InvoiceStatus::Delivered),
            "failed" => Some(InvoiceStatus::Failed),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
            InvoiceStatus::Delivered => "delivered",
            InvoiceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One purchase attempt as sent to `POST /api/rgb/invoice`.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InvoiceRequest {
    pub(crate) rgb_invoice: String,
    pub(crate) batch_count: u32,
    #[serde(rename = "tier")]
    pub(crate) tier_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) game_session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct InvoiceRecord {
    pub(crate) invoice_id: String,
    pub(crate) lightning_invoice: String,
    pub(crate) amount_sats: u64,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) status: InvoiceStatus,
    pub(crate) qr_code: Option<String>,
}

/// `expiresAt` shows up both as an ISO timestamp and as epoch millis.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireTime {
    Iso(DateTime<Utc>),
    Millis(i64),
}

impl WireTime {
    pub(crate) fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTime::Iso(t) => Some(*t),
            WireTime::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateInvoiceResponse {
    #[serde(default)]
    pub(crate) success: bool,
    pub(crate) invoice_id: Option<String>,
    pub(crate) lightning_invoice: Option<String>,
    #[serde(default)]
    pub(crate) amount: u64,
    pub(crate) expires_at: Option<WireTime>,
    pub(crate) qr_code: Option<String>,
    pub(crate) error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct StatusResponse {
    pub(crate) status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_backend_field_names() {
        let req = InvoiceRequest {
            rgb_invoice: "rgb:utxob:abc".into(),
            batch_count: 3,
            tier_label: "silver".into(),
            email: None,
            game_session_id: Some("gs-1".into()),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "rgbInvoice": "rgb:utxob:abc",
                "batchCount": 3,
                "tier": "silver",
                "gameSessionId": "gs-1"
            })
        );
    }

    #[test]
    fn expires_at_accepts_iso_and_millis() {
        let iso: CreateInvoiceResponse = serde_json::from_str(
            r#"{"success":true,"invoiceId":"a","lightningInvoice":"lnbc1","amount":2000,
                "expiresAt":"2026-01-01T00:15:00Z"}"#,
        )
        .unwrap();
        let ms: CreateInvoiceResponse = serde_json::from_str(
            r#"{"success":true,"invoiceId":"a","lightningInvoice":"lnbc1","amount":2000,
                "expiresAt":1767226500000}"#,
        )
        .unwrap();
        let a = iso.expires_at.and_then(|t| t.to_utc()).unwrap();
        let b = ms.expires_at.and_then(|t| t.to_utc()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_status_is_not_guessed() {
        assert_eq!(InvoiceStatus::from_wire(" PAID "), Some(InvoiceStatus::Paid));
        assert_eq!(InvoiceStatus::from_wire("settling"), None);
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(InvoiceStatus::Delivered.is_terminal());
    }
}
