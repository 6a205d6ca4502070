//! Validation rules for payment submissions
//!
//! Mirrors the `payments` table constraints so bad input is rejected before
//! it reaches the database.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::{Currency, NewPayment, SubmitPayment};

/// Largest amount representable by `NUMERIC(12,2)`
pub const MAX_AMOUNT: Decimal = dec!(9999999999.99);

pub const MAX_REFERENCE_LEN: usize = 255;

/// Validation errors for payment submissions
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("amount must not exceed {max}, got {0}", max = MAX_AMOUNT)]
    AmountTooLarge(Decimal),

    #[error("amount must have at most 2 decimal places, got {0}")]
    TooManyDecimalPlaces(Decimal),

    #[error("currency must be one of ETB, USD, got: {0}")]
    UnsupportedCurrency(String),

    #[error("reference must not be blank")]
    BlankReference,

    #[error("reference must be between 1 and {max} characters, got {0} characters", max = MAX_REFERENCE_LEN)]
    InvalidReferenceLength(usize),

    #[error("rejected by store constraint: {0}")]
    ConstraintViolation(String),
}

/// Validate a raw submission and turn it into an insertable payment
pub fn validate_submission(request: &SubmitPayment) -> Result<NewPayment, ValidationError> {
    let currency = request
        .currency
        .parse::<Currency>()
        .map_err(|_| ValidationError::UnsupportedCurrency(request.currency.clone()))?;

    let payment = NewPayment {
        amount: request.amount,
        currency,
        reference: request.reference.clone(),
    };

    validate_new_payment(&payment)?;
    Ok(payment)
}

/// Validate the value rules of an already-typed payment
pub fn validate_new_payment(payment: &NewPayment) -> Result<(), ValidationError> {
    if payment.amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount(payment.amount));
    }

    if payment.amount > MAX_AMOUNT {
        return Err(ValidationError::AmountTooLarge(payment.amount));
    }

    // NUMERIC(12,2) would round silently
    if payment.amount.normalize().scale() > 2 {
        return Err(ValidationError::TooManyDecimalPlaces(payment.amount));
    }

    if payment.reference.trim().is_empty() {
        return Err(ValidationError::BlankReference);
    }

    let reference_len = payment.reference.chars().count();
    if reference_len > MAX_REFERENCE_LEN {
        return Err(ValidationError::InvalidReferenceLength(reference_len));
    }

    Ok(())
}
