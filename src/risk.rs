// src/risk.rs
use crate::error::AppError;
use crate::options::linspace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Long,
    Short,
}

#[derive(Debug, Deserialize)]
pub struct RiskRewardRequest {
    pub trade_type: TradeType,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    pub position_size: u32,
}

#[derive(Debug, Serialize)]
pub struct PnlPoint {
    pub price: f64,
    pub pnl: f64,
}

#[derive(Debug, Serialize)]
pub struct RiskReward {
    pub trade_type: TradeType,
    pub risk_per_share: f64,
    pub reward_per_share: f64,
    pub risk_reward_ratio: f64,
    pub total_risk: f64,
    pub total_reward: f64,
    /// Fraction of trades that must win to break even.
    pub breakeven_win_rate: f64,
    pub profit_loss: Vec<PnlPoint>,
}

pub fn calculate_risk_reward(req: &RiskRewardRequest) -> Result<RiskReward, AppError> {
    let (entry, stop, target) = (req.entry_price, req.stop_loss, req.target_price);
    let size = f64::from(req.position_size);

    let (risk_per_share, reward_per_share) = match req.trade_type {
        TradeType::Long => (entry - stop, target - entry),
        TradeType::Short => (stop - entry, entry - target),
    };
    if risk_per_share <= 0.0 {
        let message = match req.trade_type {
            TradeType::Long => {
                "Invalid parameters: Stop loss must be below entry price for long trades."
            }
            TradeType::Short => {
                "Invalid parameters: Stop loss must be above entry price for short trades."
            }
        };
        return Err(AppError::BadRequest(message.to_string()));
    }

    let ratio = reward_per_share / risk_per_share;
    let low = entry.min(stop).min(target) * 0.95;
    let high = entry.max(stop).max(target) * 1.05;
    let profit_loss = linspace(low, high, 100)
        .into_iter()
        .map(|price| PnlPoint {
            price,
            pnl: match req.trade_type {
                TradeType::Long => (price - entry) * size,
                TradeType::Short => (entry - price) * size,
            },
        })
        .collect();

    Ok(RiskReward {
        trade_type: req.trade_type,
        risk_per_share,
        reward_per_share,
        risk_reward_ratio: ratio,
        total_risk: risk_per_share * size,
        total_reward: reward_per_share * size,
        breakeven_win_rate: 1.0 / (1.0 + ratio),
        profit_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(trade_type: TradeType, entry: f64, stop: f64, target: f64) -> RiskRewardRequest {
        RiskRewardRequest {
            trade_type,
            entry_price: entry,
            stop_loss: stop,
            target_price: target,
            position_size: 100,
        }
    }

    #[test]
    fn long_trade_metrics() {
        let rr = calculate_risk_reward(&request(TradeType::Long, 100.0, 95.0, 110.0)).unwrap();
        assert_eq!(rr.risk_per_share, 5.0);
        assert_eq!(rr.reward_per_share, 10.0);
        assert_eq!(rr.risk_reward_ratio, 2.0);
        assert_eq!(rr.total_risk, 500.0);
        assert_eq!(rr.total_reward, 1000.0);
        assert!((rr.breakeven_win_rate - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(rr.profit_loss.len(), 100);
        assert!((rr.profit_loss[0].price - 95.0 * 0.95).abs() < 1e-9);
    }

    #[test]
    fn short_trade_mirrors_long() {
        let rr = calculate_risk_reward(&request(TradeType::Short, 100.0, 105.0, 90.0)).unwrap();
        assert_eq!(rr.risk_per_share, 5.0);
        assert_eq!(rr.reward_per_share, 10.0);
        assert!(rr.profit_loss.last().unwrap().pnl < 0.0);
    }

    #[test]
    fn stop_on_wrong_side_is_rejected() {
        let err = calculate_risk_reward(&request(TradeType::Long, 100.0, 101.0, 110.0)).unwrap_err();
        assert!(err.to_string().contains("below entry price"));
        let err = calculate_risk_reward(&request(TradeType::Short, 100.0, 99.0, 90.0)).unwrap_err();
        assert!(err.to_string().contains("above entry price"));
    }
}
