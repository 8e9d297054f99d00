//! Payment methods offered on the billing page.
//!
//! A method turns a requested deposit into the URL the user is sent to
//! next. Gateways that confirm asynchronously credit the account later via
//! [`AccountService::add_transaction`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use lobster_core::BILLING_PRECISION;
use lobster_core::config::PaymentConfig;
use lobster_crypto::random_alphanumeric;

use crate::billing::AccountService;
use crate::error::{PanelError, PanelResult};

/// Where the billing page sends users after a completed payment.
pub const BILLING_PAGE: &str = "/panel/billing";

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment method {0} is configured twice")]
    DuplicateMethod(String),

    #[error("payment method {name}: unknown kind {kind:?}")]
    UnknownKind { name: String, kind: String },

    #[error("payment method {0}: redirect URL is required")]
    MissingUrl(String),
}

#[async_trait]
pub trait PaymentMethod: Send + Sync {
    /// Begin a deposit of `amount` credit units and return the redirect
    /// target for the user.
    async fn payment(&self, user_id: i64, username: &str, amount: i64) -> PanelResult<String>;
}

/// Credits immediately. For development setups.
pub struct FakePayment {
    accounts: AccountService,
}

impl FakePayment {
    pub const fn new(accounts: AccountService) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl PaymentMethod for FakePayment {
    async fn payment(&self, user_id: i64, _username: &str, amount: i64) -> PanelResult<String> {
        self.accounts
            .add_transaction(user_id, "fake", &random_alphanumeric(16), "Fake credit", amount, 0)
            .await?;
        Ok(BILLING_PAGE.to_string())
    }
}

/// Sends the user to an external checkout page.
pub struct RedirectPayment {
    template: String,
}

impl RedirectPayment {
    /// `template` may contain `{USER_ID}` and `{AMOUNT}` (in currency units
    /// with two decimals).
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

#[async_trait]
impl PaymentMethod for RedirectPayment {
    async fn payment(&self, user_id: i64, _username: &str, amount: i64) -> PanelResult<String> {
        Ok(self
            .template
            .replace("{USER_ID}", &user_id.to_string())
            .replace("{AMOUNT}", &format_amount(amount)))
    }
}

/// Decimal digits carried by a credit unit.
const PRECISION_DIGITS: usize = 6;

/// Parse a signed decimal currency value such as `-0.0125` into credit
/// units, keeping up to six decimals.
pub fn parse_credit(value: &str) -> PanelResult<i64> {
    let invalid = || PanelError::validation("invalid amount");
    let value = value.trim();
    let (negative, digits) = value
        .strip_prefix('-')
        .map_or((false, value), |rest| (true, rest));
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty()
        || fraction.len() > PRECISION_DIGITS
        || !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let fraction: i64 = format!("{fraction:0<width$}", width = PRECISION_DIGITS)
        .parse()
        .map_err(|_| invalid())?;
    let units = whole
        .checked_mul(BILLING_PRECISION)
        .and_then(|u| u.checked_add(fraction))
        .ok_or_else(invalid)?;
    Ok(if negative { -units } else { units })
}

/// Parse a deposit such as `12.50` into credit units. Deposits are
/// positive and have at most two decimals.
pub fn parse_amount(value: &str) -> PanelResult<i64> {
    let value = value.trim();
    let decimals = value.split_once('.').map_or(0, |(_, fraction)| fraction.len());
    if value.starts_with('-') || decimals > 2 {
        return Err(PanelError::validation("invalid amount"));
    }
    parse_credit(value)
}

fn format_amount(amount: i64) -> String {
    let cents = amount / (BILLING_PRECISION / 100);
    format!("{}.{:02}", cents / 100, cents % 100)
}

/// Configured payment methods by name.
#[derive(Clone, Default)]
pub struct PaymentRegistry {
    methods: BTreeMap<String, Arc<dyn PaymentMethod>>,
}

impl PaymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, method: Arc<dyn PaymentMethod>) -> Result<(), PaymentError> {
        if self.methods.contains_key(name) {
            return Err(PaymentError::DuplicateMethod(name.to_string()));
        }
        self.methods.insert(name.to_string(), method);
        Ok(())
    }

    /// Build the registry from `[[payment]]` configuration entries.
    pub fn from_config(
        methods: &[PaymentConfig],
        accounts: &AccountService,
    ) -> Result<Self, PaymentError> {
        let mut registry = Self::new();
        for method in methods {
            let implementation: Arc<dyn PaymentMethod> = match method.kind.as_str() {
                "fake" => Arc::new(FakePayment::new(accounts.clone())),
                "redirect" if method.url.is_empty() => {
                    return Err(PaymentError::MissingUrl(method.name.clone()));
                }
                "redirect" => Arc::new(RedirectPayment::new(&method.url)),
                other => {
                    return Err(PaymentError::UnknownKind {
                        name: method.name.clone(),
                        kind: other.to_string(),
                    });
                }
            };
            registry.register(&method.name, implementation)?;
            info!(method = %method.name, kind = %method.kind, "Payment method registered");
        }
        Ok(registry)
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// Start a deposit through `method` after checking the allowed range.
    pub async fn pay(
        &self,
        method: &str,
        user_id: i64,
        username: &str,
        amount: i64,
        range: (i64, i64),
    ) -> PanelResult<String> {
        let (minimum, maximum) = range;
        if amount < minimum || amount > maximum {
            return Err(PanelError::validation(format!(
                "amount must be between {} and {}",
                format_amount(minimum),
                format_amount(maximum)
            )));
        }
        let implementation = self
            .methods
            .get(method)
            .ok_or_else(|| PanelError::validation("invalid payment method"))?;
        implementation.payment(user_id, username, amount).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::harness;

    const RANGE: (i64, i64) = (5 * BILLING_PRECISION, 200 * BILLING_PRECISION);

    #[test]
    fn amounts_parse_to_credit_units() {
        assert_eq!(parse_amount("10").unwrap(), 10 * BILLING_PRECISION);
        assert_eq!(parse_amount("10.5").unwrap(), 10_500_000);
        assert_eq!(parse_amount(" 0.01 ").unwrap(), 10_000);
        for bad in ["", "abc", "1.234", "-3", ".5", "1.x"] {
            assert!(parse_amount(bad).is_err(), "{bad}");
        }
        assert_eq!(format_amount(10_500_000), "10.50");
    }

    #[test]
    fn credit_keeps_six_decimals_and_sign() {
        assert_eq!(parse_credit("0.000001").unwrap(), 1);
        assert_eq!(parse_credit("-2.5").unwrap(), -2_500_000);
        assert_eq!(parse_credit("0.0125").unwrap(), 12_500);
        assert!(parse_credit("0.0000001").is_err());
        assert!(parse_credit("--1").is_err());
        assert!(parse_credit("1e3").is_err());
    }

    #[tokio::test]
    async fn redirect_substitutes_placeholders() {
        let mut registry = PaymentRegistry::new();
        registry
            .register(
                "paypal",
                Arc::new(RedirectPayment::new(
                    "https://pay.example.com/?user={USER_ID}&amount={AMOUNT}",
                )),
            )
            .unwrap();

        let url = registry
            .pay("paypal", 7, "alice", 12_500_000, RANGE)
            .await
            .unwrap();
        assert_eq!(url, "https://pay.example.com/?user=7&amount=12.50");
    }

    #[tokio::test]
    async fn range_and_method_are_checked() {
        let registry = PaymentRegistry::new();
        let err = registry.pay("fake", 1, "a", BILLING_PRECISION, RANGE).await.unwrap_err();
        assert!(err.to_string().starts_with("amount must be between 5.00 and 200.00"));
        let err = registry.pay("fake", 1, "a", RANGE.0, RANGE).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid payment method");
    }

    #[tokio::test]
    async fn fake_payment_credits_account() {
        let h = harness().await;
        let user = h.user("alice", 0).await;
        let registry = PaymentRegistry::from_config(
            &[PaymentConfig {
                name: "fake".into(),
                kind: "fake".into(),
                url: String::new(),
            }],
            &h.accounts,
        )
        .unwrap();
        assert_eq!(registry.methods(), ["fake"]);

        let target = registry
            .pay("fake", user.id, "alice", 10 * BILLING_PRECISION, RANGE)
            .await
            .unwrap();
        assert_eq!(target, BILLING_PAGE);
        assert_eq!(
            h.db.get_user(user.id).await.unwrap().credit,
            10 * BILLING_PRECISION
        );
    }

    #[tokio::test]
    async fn config_errors() {
        let h = harness().await;
        let method = |kind: &str, url: &str| PaymentConfig {
            name: "m".into(),
            kind: kind.into(),
            url: url.into(),
        };
        assert!(matches!(
            PaymentRegistry::from_config(&[method("bitcoin", "")], &h.accounts),
            Err(PaymentError::UnknownKind { .. })
        ));
        assert!(matches!(
            PaymentRegistry::from_config(&[method("redirect", "")], &h.accounts),
            Err(PaymentError::MissingUrl(_))
        ));
        assert!(matches!(
            PaymentRegistry::from_config(&[method("fake", ""), method("fake", "")], &h.accounts),
            Err(PaymentError::DuplicateMethod(_))
        ));
    }
}
