//! Anycard records: the subjects the redeem workflows act on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Anycard product line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AnycardType {
    Celebrate,
}

impl AnycardType {
    /// Display code, also the label of the wallet tile on the swap site.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Celebrate => "Celebrate",
        }
    }
}

impl fmt::Display for AnycardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for AnycardType {
    type Err = TaskError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CELEBRATE" | "CELEBRATE CARD" => Ok(Self::Celebrate),
            "" => Err(TaskError::InvalidRequest("anycardType is required".into())),
            _ => Err(TaskError::InvalidRequest(format!(
                "Unknown anycardType: {value}"
            ))),
        }
    }
}

impl TryFrom<String> for AnycardType {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnycardType> for String {
    fn from(t: AnycardType) -> Self {
        t.code().to_string()
    }
}

/// A stored anycard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anycard {
    pub id: Uuid,
    pub card_number: String,
    pub serial_number: Option<String>,
    pub pin: Option<String>,
    pub anycard_type: AnycardType,
    /// Free-form as entered by operators; see [`parse_balance`].
    pub balance: Option<String>,
    /// Still needs the bonus-claim workflow.
    pub needs_redeem: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Anycard {
    pub fn new(card_number: impl Into<String>, anycard_type: AnycardType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            card_number: card_number.into(),
            serial_number: None,
            pin: None,
            anycard_type,
            balance: None,
            needs_redeem: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn with_balance(mut self, balance: impl Into<String>) -> Self {
        self.balance = Some(balance.into());
        self
    }

    pub fn with_needs_redeem(mut self, needs_redeem: bool) -> Self {
        self.needs_redeem = needs_redeem;
        self
    }

    pub fn parsed_balance(&self) -> Option<Decimal> {
        self.balance.as_deref().and_then(parse_balance)
    }

    pub fn has_pin(&self) -> bool {
        self.pin.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    /// Eligible for the bonus-claim workflow.
    pub fn is_redeemable(&self) -> bool {
        self.needs_redeem && !self.card_number.trim().is_empty()
    }

    /// Eligible for the wallet-load workflow: funded and has a PIN.
    pub fn is_loadable(&self) -> bool {
        self.has_pin() && self.parsed_balance().is_some_and(|b| b > Decimal::ZERO)
    }

    /// Apply a full update from an operator or agent.
    pub fn apply(&mut self, input: AnycardInput) {
        self.card_number = input.card_number;
        self.serial_number = input.serial_number;
        self.pin = input.pin;
        self.anycard_type = input.anycard_type;
        self.balance = input.balance;
        self.needs_redeem = input.needs_redeem;
        self.updated_at = Utc::now();
    }

    /// The full-update body that reproduces this record.
    pub fn to_input(&self) -> AnycardInput {
        AnycardInput {
            card_number: self.card_number.clone(),
            serial_number: self.serial_number.clone(),
            pin: self.pin.clone(),
            anycard_type: self.anycard_type,
            balance: self.balance.clone(),
            needs_redeem: self.needs_redeem,
        }
    }
}

/// Body of `POST /api/anycards` and `PUT /api/anycards/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnycardInput {
    pub card_number: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    pub anycard_type: AnycardType,
    #[serde(default)]
    pub balance: Option<String>,
    #[serde(default)]
    pub needs_redeem: bool,
}

/// Parse a loosely formatted money string (`"$15.00"`, `"CA$ 1,234.5"`).
///
/// Everything except digits, `.` and `-` is dropped. Blank or unparsable input is
/// `None`, never zero.
pub fn parse_balance(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_balance_is_tolerant() {
        assert_eq!(parse_balance("$15.00"), Some(dec!(15.00)));
        assert_eq!(parse_balance("CA$ 1,234.50"), Some(dec!(1234.50)));
        assert_eq!(parse_balance(" 10 "), Some(dec!(10)));
        assert_eq!(parse_balance("-3"), Some(dec!(-3)));
    }

    #[test]
    fn parse_balance_unknown_is_none() {
        assert_eq!(parse_balance(""), None);
        assert_eq!(parse_balance("n/a"), None);
        assert_eq!(parse_balance("1.2.3"), None);
    }

    #[test]
    fn loadable_needs_pin_and_positive_balance() {
        let card = Anycard::new("6001", AnycardType::Celebrate).with_balance("$10");
        assert!(!card.is_loadable());
        let card = card.with_pin("1234");
        assert!(card.is_loadable());
        let zero = Anycard::new("6002", AnycardType::Celebrate)
            .with_pin("1")
            .with_balance("0");
        assert!(!zero.is_loadable());
        let blank_pin = Anycard::new("6003", AnycardType::Celebrate)
            .with_pin("  ")
            .with_balance("5");
        assert!(!blank_pin.is_loadable());
    }

    #[test]
    fn redeemable_follows_flag() {
        let card = Anycard::new("6001", AnycardType::Celebrate);
        assert!(!card.is_redeemable());
        assert!(card.with_needs_redeem(true).is_redeemable());
    }

    #[test]
    fn anycard_type_parses_loosely() {
        assert_eq!("celebrate".parse::<AnycardType>().unwrap(), AnycardType::Celebrate);
        assert_eq!(
            "Celebrate Card".parse::<AnycardType>().unwrap(),
            AnycardType::Celebrate
        );
        assert!("Birthday".parse::<AnycardType>().is_err());
        let json = serde_json::to_string(&AnycardType::Celebrate).unwrap();
        assert_eq!(json, "\"Celebrate\"");
    }

    #[test]
    fn input_roundtrips_through_apply() {
        let mut card = Anycard::new("6001", AnycardType::Celebrate)
            .with_pin("1111")
            .with_balance("25");
        let mut input = card.to_input();
        input.balance = Some("0".into());
        card.apply(input);
        assert_eq!(card.balance.as_deref(), Some("0"));
        assert_eq!(card.pin.as_deref(), Some("1111"));
    }
}
