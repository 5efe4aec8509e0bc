//! Gas fee resolution and escalation
//!
//! Fees come from the caller's override when present, otherwise from network
//! fee data with the profile's safety buffer applied. All results are clamped
//! into the profile's [min, max] band; escalation multiplies by the profile's
//! inflation factor and clamps at the max.

use crate::config::NetworkProfile;
use crate::error::{BroadcastError, BroadcastResult};
use crate::provider::endpoint::RpcEndpoint;

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Gas price types, legacy and EIP-1559
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GasFees {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasFees {
    /// The effective price ceiling of this fee setting
    pub fn cap(&self) -> U256 {
        match self {
            GasFees::Legacy { gas_price } => *gas_price,
            GasFees::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Multiply both fields by `percent` (125 = +25%)
    pub fn scale(self, percent: u64) -> Self {
        let factor = U256::from(percent);
        let hundred = U256::from(100u64);
        match self {
            GasFees::Legacy { gas_price } => GasFees::Legacy {
                gas_price: gas_price * factor / hundred,
            },
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasFees::Eip1559 {
                max_fee_per_gas: max_fee_per_gas * factor / hundred,
                max_priority_fee_per_gas: max_priority_fee_per_gas * factor / hundred,
            },
        }
    }

    /// Clamp into [min, max]; the priority fee never exceeds the fee cap
    pub fn clamp(self, min: U256, max: U256) -> Self {
        match self {
            GasFees::Legacy { gas_price } => GasFees::Legacy {
                gas_price: gas_price.clamp(min, max),
            },
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = max_fee_per_gas.clamp(min, max);
                GasFees::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: max_priority_fee_per_gas.min(max_fee),
                }
            }
        }
    }
}

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

fn bounds(profile: &NetworkProfile) -> (U256, U256) {
    (
        gwei(profile.min_gas_price_gwei),
        gwei(profile.max_gas_price_gwei),
    )
}

/// Resolve fees for a request: caller override wins, otherwise network fee
/// data with the profile's safety buffer, clamped into the profile band.
pub async fn resolve(
    fee_override: Option<GasFees>,
    profile: &NetworkProfile,
    endpoint: &dyn RpcEndpoint,
) -> BroadcastResult<GasFees> {
    let (min, max) = bounds(profile);

    if let Some(fees) = fee_override {
        // Explicit caller fees are respected but never allowed past the cap
        return Ok(fees.clamp(U256::zero(), max));
    }

    let fee_data = endpoint.fee_data().await.map_err(|e| BroadcastError::Network {
        provider_id: "fee-query".to_string(),
        message: e.message,
    })?;

    let fees = if profile.eip1559 {
        match (fee_data.max_fee_per_gas, fee_data.max_priority_fee_per_gas) {
            (Some(max_fee), Some(priority)) => GasFees::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            },
            _ => legacy_from(&fee_data, profile)?,
        }
    } else {
        legacy_from(&fee_data, profile)?
    };

    let resolved = fees.scale(profile.fee_safety_percent).clamp(min, max);
    debug!(chain_id = profile.chain_id, fees = ?resolved, "fees resolved");
    Ok(resolved)
}

fn legacy_from(
    fee_data: &crate::provider::endpoint::FeeData,
    profile: &NetworkProfile,
) -> BroadcastResult<GasFees> {
    let gas_price = fee_data
        .gas_price
        .ok_or_else(|| BroadcastError::Network {
            provider_id: "fee-query".to_string(),
            message: format!("no gas price reported for chain {}", profile.chain_id),
        })?;
    Ok(GasFees::Legacy { gas_price })
}

/// Escalate fees for an underpriced retry, capped at the profile max
pub fn escalate(fees: GasFees, profile: &NetworkProfile) -> GasFees {
    let (_, max) = bounds(profile);
    fees.scale(profile.gas_inflation_percent)
        .clamp(U256::zero(), max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::endpoint::FeeData;
    use crate::testing::{test_profile, MockEndpoint};

    #[test]
    fn escalation_compounds_per_retry() {
        let profile = test_profile(1); // 125% inflation, 100 gwei cap
        let initial = GasFees::Legacy {
            gas_price: gwei(10),
        };

        let mut fees = initial;
        for _ in 0..3 {
            fees = escalate(fees, &profile);
        }

        // 10 gwei * 1.25^3
        assert_eq!(fees.cap(), U256::from(19_531_250_000u64));
    }

    #[test]
    fn escalation_clamps_at_network_max() {
        let mut profile = test_profile(1);
        profile.max_gas_price_gwei = 15;

        let mut fees = GasFees::Legacy {
            gas_price: gwei(10),
        };
        for _ in 0..3 {
            fees = escalate(fees, &profile);
        }
        assert_eq!(fees.cap(), gwei(15));
    }

    #[test]
    fn eip1559_priority_never_exceeds_cap() {
        let fees = GasFees::Eip1559 {
            max_fee_per_gas: gwei(50),
            max_priority_fee_per_gas: gwei(40),
        };
        let clamped = fees.clamp(U256::zero(), gwei(30));
        match clamped {
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, gwei(30));
                assert_eq!(max_priority_fee_per_gas, gwei(30));
            }
            _ => panic!("expected eip1559 fees"),
        }
    }

    #[tokio::test]
    async fn caller_override_wins_but_is_capped() {
        let profile = test_profile(1);
        let endpoint = MockEndpoint::new();

        let fees = resolve(
            Some(GasFees::Legacy {
                gas_price: gwei(500),
            }),
            &profile,
            &endpoint,
        )
        .await
        .unwrap();
        assert_eq!(fees.cap(), gwei(100));
    }

    #[tokio::test]
    async fn network_fees_get_safety_buffer() {
        let profile = test_profile(1); // legacy, 110% safety
        let endpoint = MockEndpoint::new();
        endpoint.set_fee_data(FeeData {
            gas_price: Some(gwei(10)),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        });

        let fees = resolve(None, &profile, &endpoint).await.unwrap();
        assert_eq!(fees.cap(), gwei(11));
    }

    #[tokio::test]
    async fn eip1559_profile_uses_fee_fields() {
        let mut profile = test_profile(1);
        profile.eip1559 = true;
        profile.fee_safety_percent = 100;
        let endpoint = MockEndpoint::new();

        let fees = resolve(None, &profile, &endpoint).await.unwrap();
        match fees {
            GasFees::Eip1559 { .. } => {}
            _ => panic!("expected eip1559 fees"),
        }
    }
}
