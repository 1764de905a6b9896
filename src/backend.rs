use crate::config::Settings;
use crate::model::{
    CreateInvoiceResponse, ErrorBody, InvoiceRecord, InvoiceRequest, InvoiceStatus,
    StatusResponse,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid invoice id {0:?}")]
    InvalidId(String),
    #[error("bad API base URL: {0}")]
    BaseUrl(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

/// The purchase backend. Invoice creation, settlement and consignment
/// generation all happen on the other side of this trait.
#[async_trait]
pub(crate) trait Backend: Send + Sync {
    async fn create_invoice(&self, req: &InvoiceRequest) -> Result<InvoiceRecord, BackendError>;
    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus, BackendError>;
    async fn fetch_consignment(&self, invoice_id: &str) -> Result<Vec<u8>, BackendError>;
}

pub(crate) struct HttpBackend {
    client: reqwest::Client,
    root: Url,
}

impl HttpBackend {
    pub(crate) fn new(settings: &Settings) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("lightcat/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let root = Url::parse(settings.api_root())
            .map_err(|e| BackendError::BaseUrl(format!("{}: {e}", settings.api_base)))?;
        if root.cannot_be_a_base() {
            return Err(BackendError::BaseUrl(settings.api_base.clone()));
        }
        Ok(Self { client, root })
    }

    /// Appends `segments` to the base path. Each one is percent-encoded as a
    /// single segment, so `/`, `?` and `#` inside an id stay in the id.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.root.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::BaseUrl(self.root.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Dot segments are dropped by URL normalisation and would address the
/// parent resource instead.
fn checked_id(invoice_id: &str) -> Result<&str, BackendError> {
    match invoice_id.trim() {
        "" | "." | ".." => Err(BackendError::InvalidId(invoice_id.to_string())),
        _ => Ok(invoice_id),
    }
}

/// Non-2xx responses carry `{ "error": "..." }` when the backend is healthy;
/// fall back to the raw body (truncated) when it is not.
async fn rejection(resp: reqwest::Response) -> BackendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| body.chars().take(200).collect());
    BackendError::Rejected { status, message }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_invoice(&self, req: &InvoiceRequest) -> Result<InvoiceRecord, BackendError> {
        let resp = self
            .client
            .post(self.url(&["api", "rgb", "invoice"])?)
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let status = resp.status().as_u16();
        let body: CreateInvoiceResponse = resp.json().await?;
        record_from_response(body, status)
    }

    async fn invoice_status(&self, invoice_id: &str) -> Result<InvoiceStatus, BackendError> {
        let resp = self
            .client
            .get(self.url(&["api", "rgb", "invoice", checked_id(invoice_id)?, "status"])?)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let body: StatusResponse = resp.json().await?;
        InvoiceStatus::from_wire(&body.status)
            .ok_or_else(|| BackendError::Decode(format!("unknown status {:?}", body.status)))
    }

    async fn fetch_consignment(&self, invoice_id: &str) -> Result<Vec<u8>, BackendError> {
        let resp = self
            .client
            .get(self.url(&["api", "rgb", "consignment", checked_id(invoice_id)?])?)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

pub(crate) fn record_from_response(
    body: CreateInvoiceResponse,
    status: u16,
) -> Result<InvoiceRecord, BackendError> {
    if !body.success {
        return Err(BackendError::Rejected {
            status,
            message: body.error.unwrap_or_else(|| "invoice creation failed".to_string()),
        });
    }
    let invoice_id = body
        .invoice_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BackendError::Decode("missing invoiceId".into()))?;
    let lightning_invoice = body
        .lightning_invoice
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BackendError::Decode("missing lightningInvoice".into()))?;
    // No expiry from the server means the standard invoice lifetime.
    let expires_at = body
        .expires_at
        .and_then(|t| t.to_utc())
        .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(15));
    Ok(InvoiceRecord {
        invoice_id,
        lightning_invoice,
        amount_sats: body.amount,
        expires_at,
        status: InvoiceStatus::Pending,
        qr_code: body.qr_code,
    })
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted in-memory backend that counts every call.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub(crate) creates: AtomicUsize,
        pub(crate) polls: AtomicUsize,
        pub(crate) downloads: AtomicUsize,
        pub(crate) polls_in_flight: AtomicUsize,
        pub(crate) max_polls_in_flight: AtomicUsize,
        pub(crate) create_delay: Option<Duration>,
        pub(crate) create_hangs: bool,
        pub(crate) panic_next_create: AtomicBool,
        pub(crate) poll_delay: Option<Duration>,
        pub(crate) create_results: Mutex<VecDeque<Result<InvoiceRecord, BackendError>>>,
        pub(crate) statuses: Mutex<VecDeque<Result<InvoiceStatus, BackendError>>>,
        pub(crate) last_request: Mutex<Option<InvoiceRequest>>,
    }

    pub(crate) fn record(id: &str, lifetime: chrono::Duration) -> InvoiceRecord {
        InvoiceRecord {
            invoice_id: id.to_string(),
            lightning_invoice: "lnbc20u1pfakeinvoice".to_string(),
            amount_sats: 2000,
            expires_at: Utc::now() + lifetime,
            status: InvoiceStatus::Pending,
            qr_code: None,
        }
    }

    impl FakeBackend {
        pub(crate) fn push_create(&self, r: Result<InvoiceRecord, BackendError>) {
            self.create_results.lock().unwrap().push_back(r);
        }

        pub(crate) fn push_status(&self, s: Result<InvoiceStatus, BackendError>) {
            self.statuses.lock().unwrap().push_back(s);
        }

        pub(crate) fn count(c: &AtomicUsize) -> usize {
            c.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn create_invoice(
            &self,
            req: &InvoiceRequest,
        ) -> Result<InvoiceRecord, BackendError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(req.clone());
            if self.panic_next_create.swap(false, Ordering::SeqCst) {
                panic!("backend crashed mid-request");
            }
            if self.create_hangs {
                std::future::pending::<()>().await;
            }
            if let Some(d) = self.create_delay {
                tokio::time::sleep(d).await;
            }
            let next = self.create_results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(record("inv_default", chrono::Duration::minutes(15))))
        }

        async fn invoice_status(&self, _invoice_id: &str) -> Result<InvoiceStatus, BackendError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let now = self.polls_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_polls_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.poll_delay {
                tokio::time::sleep(d).await;
            }
            self.polls_in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self.statuses.lock().unwrap().pop_front();
            next.unwrap_or(Ok(InvoiceStatus::Pending))
        }

        async fn fetch_consignment(&self, invoice_id: &str) -> Result<Vec<u8>, BackendError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("consignment:{invoice_id}").into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> CreateInvoiceResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn success_response_becomes_pending_record() {
        let r = record_from_response(
            body(
                r#"{"success":true,"invoiceId":"inv_9","lightningInvoice":"lnbc1x",
                    "amount":6000,"expiresAt":"2026-10-19T12:15:00Z",
                    "qrCode":"data:image/png;base64,AA"}"#,
            ),
            200,
        )
        .unwrap();
        assert_eq!(r.invoice_id, "inv_9");
        assert_eq!(r.amount_sats, 6000);
        assert_eq!(r.status, InvoiceStatus::Pending);
        assert!(r.qr_code.is_some());
    }

    #[test]
    fn unsuccessful_body_is_rejection() {
        let err = record_from_response(
            body(r#"{"success":false,"error":"Game not completed"}"#),
            200,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Rejected { status: 200, ref message } if message == "Game not completed"
        ));
    }

    #[test]
    fn missing_fields_are_decode_errors() {
        let err =
            record_from_response(body(r#"{"success":true,"lightningInvoice":"lnbc1"}"#), 200)
                .unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[test]
    fn missing_expiry_defaults_to_fifteen_minutes() {
        let r = record_from_response(
            body(r#"{"success":true,"invoiceId":"a","lightningInvoice":"lnbc1"}"#),
            200,
        )
        .unwrap();
        let left = r.expires_at - Utc::now();
        assert!(left <= chrono::Duration::minutes(15));
        assert!(left > chrono::Duration::minutes(14));
    }

    fn http(base: &str) -> HttpBackend {
        HttpBackend::new(&Settings {
            api_base: base.to_string(),
            ..Settings::default()
        })
        .unwrap()
    }

    #[test]
    fn invoice_id_stays_one_path_segment() {
        let b = http("http://localhost:3000/");
        let id = "../../admin?x=1#";
        let url = b
            .url(&["api", "rgb", "invoice", checked_id(id).unwrap(), "status"])
            .unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        let segments: Vec<&str> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(&segments[..3], ["api", "rgb", "invoice"]);
        assert_eq!(segments[4], "status");
        assert!(!segments[3].contains('/'));
    }

    #[test]
    fn base_path_is_kept() {
        let b = http("https://rgblightcat.com/shop/");
        let url = b.url(&["api", "rgb", "consignment", "inv_1"]).unwrap();
        assert_eq!(url.as_str(), "https://rgblightcat.com/shop/api/rgb/consignment/inv_1");
    }

    #[test]
    fn dot_and_empty_ids_are_refused() {
        for id in ["", " ", ".", ".."] {
            assert!(matches!(checked_id(id), Err(BackendError::InvalidId(_))), "{id:?}");
        }
        assert_eq!(checked_id("inv_1").unwrap(), "inv_1");
    }

    #[test]
    fn unusable_base_url_is_reported() {
        let err = HttpBackend::new(&Settings {
            api_base: "not a url".to_string(),
            ..Settings::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, BackendError::BaseUrl(_)));
    }
}
