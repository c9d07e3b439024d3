//! Profit model.
//!
//! Converts a unit's hardware profile and a market quote into an hourly
//! profit estimate net of electricity cost:
//!
//! ```text
//! profit/h = output_rate × efficiency × price / difficulty − power_kW × rate
//! roi      = profit/h / power_kW
//! ```
//!
//! Pure and deterministic: the same unit and quote always give the same
//! number, and nothing is mutated.

use crate::types::{FleetError, Quote, Unit};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfitModel {
    /// CHF per kWh.
    electricity_rate: f64,
}

/// Profit and ROI for one unit on one quote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfitEstimate {
    pub hourly_profit: f64,
    pub roi: f64,
}

impl ProfitModel {
    pub fn new(electricity_rate: f64) -> Self {
        Self { electricity_rate }
    }

    /// Hourly profit in CHF. May be negative when power costs dominate.
    pub fn estimate_profit(&self, unit: &Unit, quote: &Quote) -> Result<f64, FleetError> {
        check_unit(unit)?;
        if !quote.difficulty.is_finite() || quote.difficulty <= 0.0 {
            return Err(FleetError::InvalidQuote {
                work_item_id: quote.work_item_id.clone(),
                reason: format!("difficulty {} must be positive", quote.difficulty),
            });
        }
        if !quote.price.is_finite() {
            return Err(FleetError::InvalidQuote {
                work_item_id: quote.work_item_id.clone(),
                reason: format!("price {} is not finite", quote.price),
            });
        }

        let revenue = unit.base_output_rate * unit.efficiency_factor * quote.price / quote.difficulty;
        let power_cost = unit.power_kw() * self.electricity_rate;
        let profit = revenue - power_cost;

        if !profit.is_finite() {
            return Err(FleetError::InvalidUnit {
                unit_id: unit.id.clone(),
                reason: "profit estimate overflowed".to_string(),
            });
        }
        Ok(profit)
    }

    /// Profit together with ROI (profit per kW drawn).
    pub fn evaluate(&self, unit: &Unit, quote: &Quote) -> Result<ProfitEstimate, FleetError> {
        let hourly_profit = self.estimate_profit(unit, quote)?;
        Ok(ProfitEstimate {
            hourly_profit,
            roi: hourly_profit / unit.power_kw(),
        })
    }
}

/// Reject hardware profiles that cannot produce a meaningful estimate.
fn check_unit(unit: &Unit) -> Result<(), FleetError> {
    let invalid = |reason: &str| FleetError::InvalidUnit {
        unit_id: unit.id.clone(),
        reason: reason.to_string(),
    };

    if !unit.power_consumption_w.is_finite() || unit.power_consumption_w <= 0.0 {
        return Err(invalid("power consumption must be positive"));
    }
    if !unit.base_output_rate.is_finite() || unit.base_output_rate < 0.0 {
        return Err(invalid("output rate must be a non-negative number"));
    }
    if !unit.efficiency_factor.is_finite() || unit.efficiency_factor < 0.0 {
        return Err(invalid("efficiency factor must be a non-negative number"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quote(price: f64, difficulty: f64) -> Quote {
        Quote {
            work_item_id: "sha256".to_string(),
            price,
            difficulty,
            volatility_pct: 0.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_profit_formula() {
        let model = ProfitModel::new(0.20);
        // 1000 × 0.9 × 2.0 / 100 = 18.0 revenue; 1.5 kW × 0.20 = 0.30 cost
        let unit = Unit::new("rig-1", "asic", 1000.0, 1500.0, 0.9);
        let profit = model.estimate_profit(&unit, &quote(2.0, 100.0)).unwrap();
        assert!((profit - 17.7).abs() < 1e-9);
    }

    #[test]
    fn test_profit_can_be_negative() {
        let model = ProfitModel::new(0.50);
        let unit = Unit::new("rig-1", "gpu", 1.0, 2000.0, 1.0);
        let profit = model.estimate_profit(&unit, &quote(0.01, 1000.0)).unwrap();
        assert!(profit < 0.0);
    }

    #[test]
    fn test_zero_difficulty_is_invalid_quote() {
        let model = ProfitModel::new(0.20);
        let unit = Unit::new("rig-1", "asic", 1000.0, 1500.0, 1.0);
        let err = model.estimate_profit(&unit, &quote(2.0, 0.0)).unwrap_err();
        assert!(matches!(err, FleetError::InvalidQuote { .. }));
    }

    #[test]
    fn test_malformed_unit_is_invalid_unit() {
        let model = ProfitModel::new(0.20);
        let unit = Unit::new("rig-1", "asic", 1000.0, 0.0, 1.0);
        let err = model.estimate_profit(&unit, &quote(2.0, 10.0)).unwrap_err();
        assert!(matches!(err, FleetError::InvalidUnit { .. }));

        let unit = Unit::new("rig-2", "asic", f64::NAN, 100.0, 1.0);
        assert!(model.estimate_profit(&unit, &quote(2.0, 10.0)).is_err());
    }

    #[test]
    fn test_roi_is_profit_per_kw() {
        let model = ProfitModel::new(0.0);
        let unit = Unit::new("rig-1", "gpu", 100.0, 500.0, 1.0);
        let est = model.evaluate(&unit, &quote(1.0, 20.0)).unwrap();
        // profit 5.0 over 0.5 kW
        assert!((est.hourly_profit - 5.0).abs() < 1e-12);
        assert!((est.roi - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_deterministic() {
        let model = ProfitModel::new(0.17);
        let unit = Unit::new("rig-1", "gpu", 123.0, 321.0, 0.8);
        let q = quote(0.3, 7.0);
        assert_eq!(model.evaluate(&unit, &q).unwrap(), model.evaluate(&unit, &q).unwrap());
    }
}
