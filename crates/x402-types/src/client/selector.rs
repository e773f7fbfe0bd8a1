//! Picks the `(requirement, signer)` pair used to pay a 402 response.
//!
//! The search is two-level. Requirements are walked in the order the server listed them;
//! for each one, signers are walked by ascending [`Signer::priority`] (ties keep
//! registration order). The first signer that can sign the requirement and whose
//! [`Signer::max_amount`] covers its amount wins. Requirement order therefore dominates
//! signer priority.

use alloy_primitives::U256;
use std::sync::Arc;

use crate::client::{Signer, X402Error};
use crate::proto::{PaymentPayload, PaymentRequirements};

/// The chosen pair, ready to be signed.
pub struct Selection<'a> {
    pub requirements: &'a PaymentRequirements,
    pub signer: &'a Arc<dyn Signer>,
}

impl Selection<'_> {
    /// Asks the selected signer for a payload.
    pub async fn sign(&self) -> Result<PaymentPayload, X402Error> {
        self.signer
            .sign(self.requirements)
            .await
            .map_err(|source| X402Error::SigningFailed {
                scheme: self.requirements.scheme.clone(),
                network: self.requirements.network.clone(),
                source,
            })
    }
}

/// Parses a `maxAmountRequired` decimal integer string.
///
/// Only ASCII digits are accepted, surrounding whitespace aside. Signs, separators and
/// radix prefixes are rejected.
pub fn parse_amount(amount: &str) -> Result<U256, X402Error> {
    let digits = amount.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(X402Error::InvalidRequirements(format!(
            "invalid amount {amount:?}: expected a decimal integer"
        )));
    }
    U256::from_str_radix(digits, 10)
        .map_err(|e| X402Error::InvalidRequirements(format!("invalid amount {amount:?}: {e}")))
}

/// Selects the first qualifying pair without signing.
///
/// A requirement whose amount does not parse is skipped. If nothing qualifies, the
/// error is [`X402Error::InvalidRequirements`] when some requirement was skipped for
/// that reason and [`X402Error::NoValidSigner`] otherwise.
pub fn select<'a>(
    requirements: &'a [PaymentRequirements],
    signers: &'a [Arc<dyn Signer>],
) -> Result<Selection<'a>, X402Error> {
    let mut by_priority: Vec<&'a Arc<dyn Signer>> = signers.iter().collect();
    by_priority.sort_by_key(|signer| signer.priority());

    let mut invalid = None;
    for requirement in requirements {
        let amount = match parse_amount(&requirement.max_amount_required) {
            Ok(amount) => amount,
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::debug!(
                    scheme = %requirement.scheme,
                    network = %requirement.network,
                    error = %err,
                    "Skipping requirement with unparsable amount"
                );
                invalid = Some(err);
                continue;
            }
        };
        let signer = by_priority.iter().find(|signer| {
            signer.can_sign(requirement)
                && signer.max_amount().is_none_or(|max| amount <= max)
        });
        if let Some(signer) = signer {
            return Ok(Selection {
                requirements: requirement,
                signer,
            });
        }
    }
    Err(invalid.unwrap_or(X402Error::NoValidSigner))
}

/// Selects a pair and signs with it.
pub async fn select_and_sign(
    requirements: &[PaymentRequirements],
    signers: &[Arc<dyn Signer>],
) -> Result<PaymentPayload, X402Error> {
    select(requirements, signers)?.sign().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TokenConfig;
    use crate::facilitator::BoxError;
    use crate::proto::X402Version1;
    use serde_json::json;

    struct MockSigner {
        id: &'static str,
        scheme: &'static str,
        network: &'static str,
        priority: i32,
        max_amount: Option<U256>,
        fail: bool,
    }

    impl MockSigner {
        fn new(id: &'static str, network: &'static str, priority: i32) -> Self {
            Self {
                id,
                scheme: "exact",
                network,
                priority,
                max_amount: None,
                fail: false,
            }
        }

        fn max(mut self, max: u64) -> Self {
            self.max_amount = Some(U256::from(max));
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl Signer for MockSigner {
        fn network(&self) -> &str {
            self.network
        }

        fn scheme(&self) -> &str {
            self.scheme
        }

        fn can_sign(&self, requirements: &PaymentRequirements) -> bool {
            requirements.matches(self.scheme, self.network)
        }

        async fn sign(
            &self,
            requirements: &PaymentRequirements,
        ) -> Result<PaymentPayload, BoxError> {
            if self.fail {
                return Err("key unavailable".into());
            }
            Ok(PaymentPayload {
                x402_version: X402Version1,
                scheme: requirements.scheme.clone(),
                network: requirements.network.clone(),
                payload: json!({ "signer": self.id }),
            })
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn tokens(&self) -> &[TokenConfig] {
            &[]
        }

        fn max_amount(&self) -> Option<U256> {
            self.max_amount
        }
    }

    fn requirement(network: &str, amount: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: network.to_string(),
            max_amount_required: amount.to_string(),
            resource: "https://api.example.com/data".to_string(),
            description: String::new(),
            mime_type: "application/json".to_string(),
            output_schema: None,
            pay_to: "0xpayee".to_string(),
            max_timeout_seconds: 60,
            asset: "0xusdc".to_string(),
            extra: None,
        }
    }

    fn signers(list: Vec<MockSigner>) -> Vec<Arc<dyn Signer>> {
        list.into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Signer>)
            .collect()
    }

    async fn chosen(requirements: &[PaymentRequirements], signers: &[Arc<dyn Signer>]) -> String {
        let payload = select_and_sign(requirements, signers).await.unwrap();
        payload.payload["signer"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_lowest_priority_number_wins() {
        let signers = signers(vec![
            MockSigner::new("late", "base", 5),
            MockSigner::new("early", "base", 1),
            MockSigner::new("middle", "base", 3),
        ]);
        assert_eq!(chosen(&[requirement("base", "100")], &signers).await, "early");
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let signers = signers(vec![
            MockSigner::new("first", "base", 2),
            MockSigner::new("second", "base", 2),
        ]);
        assert_eq!(chosen(&[requirement("base", "100")], &signers).await, "first");
    }

    #[tokio::test]
    async fn test_max_amount_excludes_signer_regardless_of_priority() {
        let signers = signers(vec![
            MockSigner::new("cheap", "base", 0).max(99),
            MockSigner::new("rich", "base", 10).max(1_000),
        ]);
        assert_eq!(chosen(&[requirement("base", "100")], &signers).await, "rich");
    }

    #[tokio::test]
    async fn test_max_amount_is_inclusive() {
        let signers = signers(vec![MockSigner::new("exact", "base", 0).max(100)]);
        assert_eq!(chosen(&[requirement("base", "100")], &signers).await, "exact");
    }

    #[tokio::test]
    async fn test_requirement_order_dominates_priority() {
        let signers = signers(vec![
            MockSigner::new("solana-best", "solana", 0),
            MockSigner::new("base-worst", "base", 99),
        ]);
        let requirements = [requirement("base", "100"), requirement("solana", "100")];
        assert_eq!(chosen(&requirements, &signers).await, "base-worst");
    }

    #[tokio::test]
    async fn test_unparsable_amount_skips_requirement() {
        let signers = signers(vec![MockSigner::new("any", "base", 0)]);
        let requirements = [requirement("base", "1.5"), requirement("base", "200")];
        let selection = select(&requirements, &signers).unwrap();
        assert_eq!(selection.requirements.max_amount_required, "200");
    }

    #[tokio::test]
    async fn test_only_unparsable_amounts_is_invalid_requirements() {
        let signers = signers(vec![MockSigner::new("any", "base", 0)]);
        let err = select(&[requirement("base", "ten")], &signers).err().unwrap();
        assert!(matches!(err, X402Error::InvalidRequirements(_)));
    }

    #[tokio::test]
    async fn test_no_capable_signer() {
        let signers = signers(vec![MockSigner::new("solana", "solana", 0)]);
        let err = select(&[requirement("base", "100")], &signers).err().unwrap();
        assert!(matches!(err, X402Error::NoValidSigner));
        let err = select(&[requirement("base", "100")], &[]).err().unwrap();
        assert!(matches!(err, X402Error::NoValidSigner));
    }

    #[tokio::test]
    async fn test_signing_failure_is_typed_and_does_not_fall_through() {
        let signers = signers(vec![
            MockSigner::new("broken", "base", 0).failing(),
            MockSigner::new("healthy", "base", 1),
        ]);
        let err = select_and_sign(&[requirement("base", "100")], &signers)
            .await
            .unwrap_err();
        assert!(matches!(err, X402Error::SigningFailed { .. }));
    }

    #[test]
    fn test_parse_amount_handles_large_integers() {
        let amount = parse_amount("115792089237316195423570985008687907853269984665640564039457584007913129639935")
            .unwrap();
        assert_eq!(amount, U256::MAX);
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("").is_err());
        assert_eq!(parse_amount(" 42 ").unwrap(), U256::from(42));
    }

    #[test]
    fn test_parse_amount_rejects_non_digits() {
        for amount in ["", " ", "1_000", "0x10", "+5", "1 000", "１２"] {
            assert!(
                matches!(parse_amount(amount), Err(X402Error::InvalidRequirements(_))),
                "{amount:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_amount_rejects_overflow() {
        let too_big = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!(matches!(parse_amount(too_big), Err(X402Error::InvalidRequirements(_))));
    }

    #[tokio::test]
    async fn test_blank_and_separated_amounts_are_skipped() {
        let signers = signers(vec![MockSigner::new("any", "base", 0)]);
        for amount in ["", " ", "1_000"] {
            let err = select(&[requirement("base", amount)], &signers).err().unwrap();
            assert!(
                matches!(err, X402Error::InvalidRequirements(_)),
                "{amount:?} should be invalid"
            );
        }
        let requirements = [
            requirement("base", ""),
            requirement("base", "1_000"),
            requirement("base", "1000"),
        ];
        let selection = select(&requirements, &signers).unwrap();
        assert_eq!(selection.requirements.max_amount_required, "1000");
    }
}
