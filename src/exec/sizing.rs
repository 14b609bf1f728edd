//! Position sizing: contracts from margin headroom under the per-trade
//! cap, clamped by the hard per-trade maximum.

/// Naked-put margin per contract before the broker's what-if refines it.
pub fn estimated_margin_per_contract(strike: f64) -> f64 {
    0.20 * strike * 100.0
}

/// Contracts affordable within `per_trade_margin_cap_pct` of NLV.
/// Returns 0 when even one contract would breach the cap.
pub fn size_contracts(
    net_liquidation: f64,
    per_trade_margin_cap_pct: f64,
    margin_per_contract: f64,
    max_contracts_per_trade: i64,
) -> i64 {
    if net_liquidation <= 0.0 || margin_per_contract <= 0.0 {
        return 0;
    }
    let budget = per_trade_margin_cap_pct * net_liquidation;
    let affordable = (budget / margin_per_contract).floor() as i64;
    affordable.clamp(0, max_contracts_per_trade.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_within_margin_budget() {
        // 10% of 100k = 10k budget; XSP 560 put needs ~11.2k margin
        let margin = estimated_margin_per_contract(560.0);
        assert_eq!(size_contracts(100_000.0, 0.10, margin, 10), 0);

        // 250k account affords 2 contracts
        assert_eq!(size_contracts(250_000.0, 0.10, margin, 10), 2);
    }

    #[test]
    fn hard_cap_applies() {
        assert_eq!(size_contracts(10_000_000.0, 0.10, 1_000.0, 5), 5);
    }

    #[test]
    fn degenerate_inputs_size_zero() {
        assert_eq!(size_contracts(0.0, 0.10, 1_000.0, 5), 0);
        assert_eq!(size_contracts(100_000.0, 0.10, 0.0, 5), 0);
    }
}
