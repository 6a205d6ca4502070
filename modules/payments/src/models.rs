use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned payment identifier (`SERIAL` column)
pub type PaymentId = i32;

// ============================================================================
// PAYMENT ENTITY
// ============================================================================

/// Authoritative payment record as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub amount: Decimal,
    pub currency: Currency,
    pub reference: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Supported settlement currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Etb,
    Usd,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Etb, Currency::Usd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Etb => "ETB",
            Currency::Usd => "USD",
        }
    }
}

impl FromStr for Currency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ETB" => Ok(Currency::Etb),
            "USD" => Ok(Currency::Usd),
            other => Err(ParseEnumError::new("currency", other)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment lifecycle: PENDING → SUCCESS | FAILED, never back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCESS" => Ok(PaymentStatus::Success),
            "FAILED" => Ok(PaymentStatus::Failed),
            other => Err(ParseEnumError::new("payment status", other)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only statuses a settlement decision may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminalStatus {
    Success,
    Failed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        PaymentStatus::from(*self).as_str()
    }
}

impl From<TerminalStatus> for PaymentStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Success => PaymentStatus::Success,
            TerminalStatus::Failed => PaymentStatus::Failed,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// INPUTS
// ============================================================================

/// Raw submission as received from a caller, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPayment {
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
}

/// Validated payment ready to be inserted
///
/// Carries no status: the store always inserts `PENDING`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub amount: Decimal,
    pub currency: Currency,
    pub reference: String,
}

/// A settlement delivery that can never be resolved
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: String,
    pub reason: String,
}

// ============================================================================
// QUEUE MESSAGE CONTRACT
// ============================================================================

/// Encode a payment id as a settlement message body (decimal string)
pub fn encode_payment_id(id: PaymentId) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// Decode a settlement message body; `None` for anything but a positive id
pub fn parse_payment_id(payload: &[u8]) -> Option<PaymentId> {
    let text = std::str::from_utf8(payload).ok()?;
    let id = text.trim().parse::<PaymentId>().ok()?;
    (id > 0).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parsing_is_exact() {
        assert_eq!("USD".parse::<Currency>(), Ok(Currency::Usd));
        assert_eq!("ETB".parse::<Currency>(), Ok(Currency::Etb));
        assert!("usd".parse::<Currency>().is_err());
        assert!("EUR".parse::<Currency>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Success.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert_eq!(PaymentStatus::from(TerminalStatus::Failed), PaymentStatus::Failed);
        assert_eq!(TerminalStatus::Success.as_str(), "SUCCESS");
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&PaymentStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
        let currency: Currency = serde_json::from_str("\"ETB\"").unwrap();
        assert_eq!(currency, Currency::Etb);
    }

    #[test]
    fn test_parse_payment_id() {
        assert_eq!(parse_payment_id(b"1"), Some(1));
        assert_eq!(parse_payment_id(b" 42\n"), Some(42));
        assert_eq!(parse_payment_id(&encode_payment_id(777)), Some(777));
        assert_eq!(parse_payment_id(b"abc"), None);
        assert_eq!(parse_payment_id(b""), None);
        assert_eq!(parse_payment_id(b"0"), None);
        assert_eq!(parse_payment_id(b"-3"), None);
        assert_eq!(parse_payment_id(b"1.5"), None);
        assert_eq!(parse_payment_id(&[0xff, 0xfe]), None);
    }
}
