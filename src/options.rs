// src/options.rs
//! Option pricing: Black-Scholes greeks, a CRR binomial tree for American
//! exercise, expiry payoff curves and option-chain assembly.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::str::FromStr;

/// Shares per standard equity option contract.
pub const CONTRACT_SIZE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "call" => Ok(OptionType::Call),
            "put" => Ok(OptionType::Put),
            other => Err(format!("option_type must be 'call' or 'put', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per 1% change in volatility.
    pub vega: f64,
    /// Per 1% change in the interest rate.
    pub rho: f64,
    pub price: f64,
}

/// Black-Scholes price and greeks. `None` when any of `t`, `sigma`, `s` or
/// `k` is not strictly positive.
pub fn black_scholes_greeks(
    s: f64,
    k: f64,
    t: f64,
    r: f64,
    sigma: f64,
    option_type: OptionType,
) -> Option<Greeks> {
    if !(t > 0.0 && sigma > 0.0 && s > 0.0 && k > 0.0) {
        return None;
    }
    let n = Normal::new(0.0, 1.0).ok()?;

    let sqrt_t = t.sqrt();
    let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let discount = (-r * t).exp();
    let pdf_d1 = n.pdf(d1);

    let (delta, theta, price, rho) = match option_type {
        OptionType::Call => (
            n.cdf(d1),
            (-s * pdf_d1 * sigma / (2.0 * sqrt_t) - r * k * discount * n.cdf(d2)) / 365.0,
            s * n.cdf(d1) - k * discount * n.cdf(d2),
            k * t * discount * n.cdf(d2) / 100.0,
        ),
        OptionType::Put => (
            -n.cdf(-d1),
            (-s * pdf_d1 * sigma / (2.0 * sqrt_t) + r * k * discount * n.cdf(-d2)) / 365.0,
            k * discount * n.cdf(-d2) - s * n.cdf(-d1),
            -k * t * discount * n.cdf(-d2) / 100.0,
        ),
    };

    let gamma = pdf_d1 / (s * sigma * sqrt_t);
    let vega = s * pdf_d1 * sqrt_t / 100.0;

    let greeks = Greeks {
        delta,
        gamma,
        theta,
        vega,
        rho,
        price,
    };
    [delta, gamma, theta, vega, rho, price]
        .iter()
        .all(|v| v.is_finite())
        .then_some(greeks)
}

fn intrinsic(spot: f64, k: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - k).max(0.0),
        OptionType::Put => (k - spot).max(0.0),
    }
}

/// Cox-Ross-Rubinstein binomial price. With `american` set, early exercise is
/// checked at every node.
#[allow(clippy::too_many_arguments)]
pub fn binomial_option_price(
    s: f64,
    k: f64,
    t: f64,
    r: f64,
    sigma: f64,
    steps: usize,
    option_type: OptionType,
    american: bool,
) -> Option<f64> {
    if steps == 0 || !(t > 0.0 && sigma > 0.0 && s > 0.0 && k > 0.0) {
        return None;
    }

    let dt = t / steps as f64;
    let u = (sigma * dt.sqrt()).exp();
    let d = 1.0 / u;
    let p = ((r * dt).exp() - d) / (u - d);
    let discount = (-r * dt).exp();

    // values[j] holds the node with j down-moves at the current step.
    let mut values: Vec<f64> = (0..=steps)
        .map(|j| {
            let spot = s * u.powi((steps - j) as i32) * d.powi(j as i32);
            intrinsic(spot, k, option_type)
        })
        .collect();

    for i in (0..steps).rev() {
        for j in 0..=i {
            let mut value = discount * (p * values[j] + (1.0 - p) * values[j + 1]);
            if american {
                let spot = s * u.powi((i - j) as i32) * d.powi(j as i32);
                value = value.max(intrinsic(spot, k, option_type));
            }
            values[j] = value;
        }
    }

    values.first().copied().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PayoffPoint {
    pub price: f64,
    pub payoff_per_share: f64,
    pub total_payoff: f64,
}

/// Expiry P/L across 100 underlying prices spanning 0.7·S to 1.3·S.
pub fn option_profit_loss(
    s: f64,
    k: f64,
    premium: f64,
    option_type: OptionType,
    contract_size: f64,
) -> Vec<PayoffPoint> {
    linspace(0.7 * s, 1.3 * s, 100)
        .into_iter()
        .map(|price| {
            let payoff_per_share = intrinsic(price, k, option_type) - premium;
            PayoffPoint {
                price,
                payoff_per_share,
                total_payoff: payoff_per_share * contract_size,
            }
        })
        .collect()
}

pub fn option_breakeven(k: f64, premium: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => k + premium,
        OptionType::Put => k - premium,
    }
}

pub(crate) fn linspace(start: f64, end: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (points - 1) as f64;
            (0..points).map(|i| start + step * i as f64).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStyle {
    European,
    American,
}

#[derive(Debug, Deserialize)]
pub struct OptionAnalysisRequest {
    pub option_type: OptionType,
    #[serde(default = "default_style")]
    pub contract_style: ContractStyle,
    pub stock_price: f64,
    pub strike_price: f64,
    pub days: f64,
    /// Percent, e.g. `1.0` for 1%.
    pub rate: f64,
    /// Percent, e.g. `25.0` for 25%.
    pub volatility: f64,
    #[serde(default = "default_contracts")]
    pub contracts: u32,
}

fn default_style() -> ContractStyle {
    ContractStyle::European
}

fn default_contracts() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct OptionAnalysis {
    pub greeks: Greeks,
    pub european_price: f64,
    pub american_price: f64,
    pub premium_per_contract: f64,
    pub total_premium: f64,
    pub breakeven: f64,
    pub max_risk: f64,
    /// `None` means unlimited (calls) or not meaningful.
    pub potential_profit: Option<f64>,
    pub profit_loss: Vec<PayoffPoint>,
}

const AMERICAN_TREE_STEPS: usize = 200;

pub fn analyze_option(req: &OptionAnalysisRequest) -> Option<OptionAnalysis> {
    let t = req.days / 365.0;
    let r = req.rate / 100.0;
    let sigma = req.volatility / 100.0;
    let contracts = f64::from(req.contracts.max(1));

    let greeks = black_scholes_greeks(req.stock_price, req.strike_price, t, r, sigma, req.option_type)?;
    let american_price = match req.contract_style {
        ContractStyle::American => binomial_option_price(
            req.stock_price,
            req.strike_price,
            t,
            r,
            sigma,
            AMERICAN_TREE_STEPS,
            req.option_type,
            true,
        )?
        // Early exercise is never worth less than holding; the tree's
        // discretisation error must not say otherwise.
        .max(greeks.price),
        ContractStyle::European => greeks.price,
    };

    let premium_per_contract = greeks.price * CONTRACT_SIZE;
    let total_premium = premium_per_contract * contracts;
    let potential_profit = match req.option_type {
        OptionType::Call => None,
        OptionType::Put if greeks.price < req.strike_price => {
            Some((req.strike_price - greeks.price) * CONTRACT_SIZE * contracts)
        }
        OptionType::Put => None,
    };

    Some(OptionAnalysis {
        greeks,
        european_price: greeks.price,
        american_price,
        premium_per_contract,
        total_premium,
        breakeven: option_breakeven(req.strike_price, greeks.price, req.option_type),
        max_risk: total_premium,
        potential_profit,
        profit_loss: option_profit_loss(
            req.stock_price,
            req.strike_price,
            greeks.price,
            req.option_type,
            CONTRACT_SIZE * contracts,
        ),
    })
}

/// A listed contract as reported by the market-data provider.
#[derive(Debug, Clone, Serialize)]
pub struct OptionContract {
    pub contract_id: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub open_interest: Option<f64>,
    pub implied_volatility: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricedContract {
    #[serde(flatten)]
    pub contract: OptionContract,
    pub greeks: Option<Greeks>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionChain {
    pub symbol: String,
    pub underlying_price: f64,
    pub selected_expiration: NaiveDate,
    pub expirations: Vec<NaiveDate>,
    pub calls: Vec<PricedContract>,
    pub puts: Vec<PricedContract>,
}

/// Picks the requested expiration when listed (the earliest otherwise) and
/// prices every contract of that expiration from its implied volatility.
pub fn build_option_chain(
    symbol: &str,
    contracts: Vec<OptionContract>,
    underlying_price: f64,
    requested: Option<NaiveDate>,
    today: NaiveDate,
    risk_free_rate: f64,
) -> Option<OptionChain> {
    let mut expirations: Vec<NaiveDate> = contracts.iter().map(|c| c.expiration).collect();
    expirations.sort();
    expirations.dedup();

    let selected = match requested {
        Some(date) if expirations.contains(&date) => date,
        _ => *expirations.first()?,
    };

    let days = (selected - today).num_days() as f64;
    let t = (days / 365.0).max(0.001);

    let mut calls = Vec::new();
    let mut puts = Vec::new();
    for contract in contracts.into_iter().filter(|c| c.expiration == selected) {
        let greeks = contract.implied_volatility.and_then(|iv| {
            black_scholes_greeks(
                underlying_price,
                contract.strike,
                t,
                risk_free_rate,
                iv,
                contract.option_type,
            )
        });
        let priced = PricedContract { contract, greeks };
        match priced.contract.option_type {
            OptionType::Call => calls.push(priced),
            OptionType::Put => puts.push(priced),
        }
    }
    calls.sort_by(|a, b| a.contract.strike.total_cmp(&b.contract.strike));
    puts.sort_by(|a, b| a.contract.strike.total_cmp(&b.contract.strike));

    Some(OptionChain {
        symbol: symbol.to_string(),
        underlying_price,
        selected_expiration: selected,
        expirations,
        calls,
        puts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn black_scholes_matches_reference_values() {
        let call = black_scholes_greeks(100.0, 100.0, 1.0, 0.05, 0.2, OptionType::Call).unwrap();
        let put = black_scholes_greeks(100.0, 100.0, 1.0, 0.05, 0.2, OptionType::Put).unwrap();

        assert!(close(call.price, 10.4506, 1e-3), "call {}", call.price);
        assert!(close(put.price, 5.5735, 1e-3), "put {}", put.price);
        assert!(close(call.delta, 0.6368, 1e-3));
        assert!(close(put.delta, call.delta - 1.0, 1e-9));
        assert!(close(call.gamma, put.gamma, 1e-12));
        assert!(call.theta < 0.0);
    }

    #[test]
    fn put_call_parity_holds() {
        let (s, k, t, r, sigma) = (120.0, 110.0, 0.5, 0.03, 0.35);
        let call = black_scholes_greeks(s, k, t, r, sigma, OptionType::Call).unwrap();
        let put = black_scholes_greeks(s, k, t, r, sigma, OptionType::Put).unwrap();
        let parity = s - k * (-r * t).exp();
        assert!(close(call.price - put.price, parity, 1e-9));
    }

    #[test]
    fn degenerate_inputs_yield_none() {
        assert!(black_scholes_greeks(100.0, 100.0, 0.0, 0.05, 0.2, OptionType::Call).is_none());
        assert!(black_scholes_greeks(100.0, 100.0, 1.0, 0.05, 0.0, OptionType::Put).is_none());
        assert!(black_scholes_greeks(0.0, 100.0, 1.0, 0.05, 0.2, OptionType::Call).is_none());
        assert!(binomial_option_price(100.0, 100.0, 1.0, 0.05, 0.2, 0, OptionType::Call, false).is_none());
    }

    #[test]
    fn binomial_converges_to_black_scholes() {
        let bs = black_scholes_greeks(100.0, 100.0, 1.0, 0.05, 0.2, OptionType::Call).unwrap();
        let tree =
            binomial_option_price(100.0, 100.0, 1.0, 0.05, 0.2, 500, OptionType::Call, false).unwrap();
        assert!(close(tree, bs.price, 0.05), "tree {} vs bs {}", tree, bs.price);
    }

    #[test]
    fn american_put_is_worth_at_least_european() {
        let european =
            binomial_option_price(100.0, 110.0, 1.0, 0.05, 0.2, 200, OptionType::Put, false).unwrap();
        let american =
            binomial_option_price(100.0, 110.0, 1.0, 0.05, 0.2, 200, OptionType::Put, true).unwrap();
        assert!(american > european);
        assert!(american >= 10.0);
    }

    #[test]
    fn payoff_curve_spans_thirty_percent_either_side() {
        let curve = option_profit_loss(100.0, 100.0, 5.0, OptionType::Call, CONTRACT_SIZE);
        assert_eq!(curve.len(), 100);
        assert!(close(curve[0].price, 70.0, 1e-9));
        assert!(close(curve[99].price, 130.0, 1e-9));
        assert!(close(curve[0].payoff_per_share, -5.0, 1e-9));
        assert!(close(curve[99].total_payoff, 2500.0, 1e-6));
    }

    #[test]
    fn breakeven_depends_on_side() {
        assert_eq!(option_breakeven(100.0, 4.0, OptionType::Call), 104.0);
        assert_eq!(option_breakeven(100.0, 4.0, OptionType::Put), 96.0);
    }

    #[test]
    fn analysis_reports_unlimited_profit_for_calls() {
        let analysis = analyze_option(&OptionAnalysisRequest {
            option_type: OptionType::Call,
            contract_style: ContractStyle::American,
            stock_price: 100.0,
            strike_price: 100.0,
            days: 30.0,
            rate: 1.0,
            volatility: 25.0,
            contracts: 2,
        })
        .unwrap();
        assert!(analysis.potential_profit.is_none());
        assert!(close(analysis.total_premium, analysis.european_price * 200.0, 1e-9));
        assert!(close(analysis.american_price, analysis.european_price, 0.05));
    }

    #[test]
    fn at_the_money_american_put_never_prices_below_european() {
        let analysis = analyze_option(&OptionAnalysisRequest {
            option_type: OptionType::Put,
            contract_style: ContractStyle::American,
            stock_price: 100.0,
            strike_price: 100.0,
            days: 30.0,
            rate: 1.0,
            volatility: 25.0,
            contracts: 1,
        })
        .unwrap();
        assert!(analysis.american_price >= analysis.european_price);
        assert!(close(analysis.american_price, analysis.european_price, 0.05));
    }

    fn contract(expiration: NaiveDate, strike: f64, option_type: OptionType) -> OptionContract {
        OptionContract {
            contract_id: format!("X{}{:?}", strike, option_type),
            expiration,
            strike,
            option_type,
            last: None,
            bid: None,
            ask: None,
            volume: None,
            open_interest: None,
            implied_volatility: Some(0.3),
        }
    }

    #[test]
    fn chain_falls_back_to_earliest_expiration() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let near = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let far = NaiveDate::from_ymd_opt(2024, 2, 16).unwrap();
        let contracts = vec![
            contract(far, 100.0, OptionType::Call),
            contract(near, 105.0, OptionType::Call),
            contract(near, 95.0, OptionType::Call),
            contract(near, 100.0, OptionType::Put),
        ];

        let chain = build_option_chain(
            "AAPL",
            contracts.clone(),
            100.0,
            Some(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()),
            today,
            0.01,
        )
        .unwrap();
        assert_eq!(chain.selected_expiration, near);
        assert_eq!(chain.expirations, vec![near, far]);
        assert_eq!(chain.calls.len(), 2);
        assert_eq!(chain.calls[0].contract.strike, 95.0);
        assert_eq!(chain.puts.len(), 1);
        assert!(chain.calls.iter().all(|c| c.greeks.is_some()));

        let chosen = build_option_chain("AAPL", contracts, 100.0, Some(far), today, 0.01).unwrap();
        assert_eq!(chosen.selected_expiration, far);
        assert_eq!(chosen.calls.len(), 1);
    }

    #[test]
    fn empty_chain_is_none() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(build_option_chain("AAPL", Vec::new(), 100.0, None, today, 0.01).is_none());
    }
}
