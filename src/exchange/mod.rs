pub mod client;
pub mod executor;

pub use client::{AssetInfo, ExchangeClient, LiveExchangeClient};
pub use executor::{ExchangeExecutor, OrderAck, OrderKind};

/// Rounds to 5 significant figures, matching HyperLiquid's price tick
/// convention for assets without an explicit tick size.
pub fn round_to_5_sig_figs(val: f64) -> f64 {
    if val == 0.0 {
        return 0.0;
    }
    let d = 5 - 1 - (val.abs().log10().floor() as i32);
    let d = d.clamp(0, 10);
    let factor = 10_f64.powi(d);
    (val * factor).round() / factor
}

pub fn round_f64(val: f64, decimals: usize) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

/// Matches the Python SDK's `float_to_wire`: round to 8 decimals, then strip
/// trailing zeros. Never emits "50.00", only "50" or "50.5".
pub fn float_to_wire(x: f64) -> String {
    let rounded = format!("{:.8}", x);
    if rounded.contains('.') {
        let trimmed = rounded.trim_end_matches('0');
        let trimmed = trimmed.trim_end_matches('.');
        trimmed.to_string()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_wire_strips_trailing_zeros() {
        assert_eq!(float_to_wire(50.0), "50");
        assert_eq!(float_to_wire(50.50), "50.5");
        assert_eq!(float_to_wire(0.030000), "0.03");
    }

    #[test]
    fn round_to_5_sig_figs_matches_expectation() {
        assert_eq!(round_to_5_sig_figs(123456.789), 123460.0);
        assert_eq!(round_to_5_sig_figs(0.00012345678), 0.00012346);
    }
}
