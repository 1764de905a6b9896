use crate::tier::TierState;
use thiserror::Error;

pub(crate) const INVOICE_PREFIXES: [&str; 2] = ["rgb:", "rgb1"];
pub(crate) const MIN_INVOICE_LEN: usize = 20;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub(crate) enum ValidationError {
    #[error("invoice must start with \"rgb:\" or \"rgb1\"")]
    InvoicePrefix,
    #[error("invoice is too short (at least 20 characters)")]
    InvoiceTooShort,
    #[error("invoice must not contain whitespace")]
    InvoiceWhitespace,
    #[error("batch count must be at least 1")]
    BatchZero,
    #[error("batch count {requested} is above your tier limit of {max}")]
    BatchOverCeiling { requested: u32, max: u32 },
    #[error("email address looks invalid")]
    Email,
}

impl ValidationError {
    pub(crate) fn field(&self) -> &'static str {
        match self {
            ValidationError::InvoicePrefix
            | ValidationError::InvoiceTooShort
            | ValidationError::InvoiceWhitespace => "rgbInvoice",
            ValidationError::BatchZero | ValidationError::BatchOverCeiling { .. } => "batchCount",
            ValidationError::Email => "email",
        }
    }

    pub(crate) fn is_invoice_format(&self) -> bool {
        self.field() == "rgbInvoice"
    }
}

/// Checks an RGB invoice and returns it trimmed.
pub(crate) fn rgb_invoice(raw: &str) -> Result<&str, ValidationError> {
    let s = raw.trim();
    if !INVOICE_PREFIXES.iter().any(|p| s.starts_with(p)) {
        return Err(ValidationError::InvoicePrefix);
    }
    if s.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvoiceWhitespace);
    }
    if s.chars().count() < MIN_INVOICE_LEN {
        return Err(ValidationError::InvoiceTooShort);
    }
    Ok(s)
}

pub(crate) fn batch_count(requested: u32, tier: &TierState) -> Result<u32, ValidationError> {
    if requested == 0 {
        return Err(ValidationError::BatchZero);
    }
    if requested > tier.max_batches {
        return Err(ValidationError::BatchOverCeiling {
            requested,
            max: tier.max_batches,
        });
    }
    Ok(requested)
}

/// Empty means "no email". Anything else must be `local@domain.tld` without
/// spaces.
pub(crate) fn email(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(s) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let (local, domain) = s.split_once('@').ok_or(ValidationError::Email)?;
    let domain_ok = domain
        .rsplit_once('.')
        .map(|(host, tld)| !host.is_empty() && tld.len() >= 2)
        .unwrap_or(false);
    if local.is_empty() || !domain_ok || domain.contains('@') || s.chars().any(char::is_whitespace)
    {
        return Err(ValidationError::Email);
    }
    Ok(Some(s.to_string()))
}
