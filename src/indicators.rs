use crate::error::EngineError;

/// Hand-rolled technical indicators, matching the naming and tolerance the
/// prompt and market-data layers expect (EMA/MACD/RSI/ATR, §4.3/§4.5).
pub struct IndicatorEngine;

impl IndicatorEngine {
    pub fn ema(closes: &[f64], period: usize) -> Result<Vec<f64>, EngineError> {
        if closes.len() < period {
            return Err(EngineError::DataUnavailable(format!(
                "need at least {period} closes for EMA{period}, got {}",
                closes.len()
            )));
        }
        let k = 2.0 / (period as f64 + 1.0);
        let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
        let mut out = Vec::with_capacity(closes.len() - period + 1);
        out.push(seed);
        for &price in &closes[period..] {
            let prev = *out.last().unwrap();
            out.push(price * k + prev * (1.0 - k));
        }
        Ok(out)
    }

    pub fn macd(closes: &[f64]) -> Result<(Vec<f64>, Vec<f64>), EngineError> {
        let ema12 = Self::ema(closes, 12)?;
        let ema26 = Self::ema(closes, 26)?;
        let offset = ema12.len() - ema26.len();
        let macd_line: Vec<f64> = ema12[offset..].iter().zip(ema26.iter()).map(|(a, b)| a - b).collect();
        let signal = Self::ema(&macd_line, 9)?;
        Ok((macd_line, signal))
    }

    pub fn rsi(closes: &[f64], period: usize) -> Result<Vec<f64>, EngineError> {
        if closes.len() < period + 1 {
            return Err(EngineError::DataUnavailable(format!(
                "need at least {} closes for RSI{period}, got {}",
                period + 1,
                closes.len()
            )));
        }
        let mut gains = 0.0;
        let mut losses = 0.0;
        for w in closes[..=period].windows(2) {
            let delta = w[1] - w[0];
            if delta >= 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        let mut avg_gain = gains / period as f64;
        let mut avg_loss = losses / period as f64;
        let mut out = vec![Self::rsi_from_averages(avg_gain, avg_loss)];

        for w in closes[period..].windows(2) {
            let delta = w[1] - w[0];
            let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
            avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
            out.push(Self::rsi_from_averages(avg_gain, avg_loss));
        }
        Ok(out)
    }

    fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }

    pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Result<Vec<f64>, EngineError> {
        if highs.len() != lows.len() || lows.len() != closes.len() {
            return Err(EngineError::DataUnavailable("high/low/close arrays must be equal length".to_string()));
        }
        if closes.len() < period + 1 {
            return Err(EngineError::DataUnavailable(format!(
                "need at least {} bars for ATR{period}, got {}",
                period + 1,
                closes.len()
            )));
        }
        let mut true_ranges = Vec::with_capacity(closes.len() - 1);
        for i in 1..closes.len() {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            true_ranges.push(hl.max(hc).max(lc));
        }
        let seed = true_ranges[..period].iter().sum::<f64>() / period as f64;
        let mut out = vec![seed];
        for &tr in &true_ranges[period..] {
            let prev = *out.last().unwrap();
            out.push((prev * (period as f64 - 1.0) + tr) / period as f64);
        }
        Ok(out)
    }

    pub fn volume_average(volumes: &[f64]) -> f64 {
        if volumes.is_empty() {
            return 0.0;
        }
        volumes.iter().sum::<f64>() / volumes.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising_series(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn ema_seeds_with_simple_average() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = IndicatorEngine::ema(&closes, 3).unwrap();
        assert_eq!(ema[0], 2.0);
        assert_eq!(ema.len(), 3);
    }

    #[test]
    fn ema_insufficient_history_errors() {
        let closes = vec![1.0, 2.0];
        assert!(IndicatorEngine::ema(&closes, 5).is_err());
    }

    #[test]
    fn rsi_is_100_for_strictly_rising_series() {
        let closes = rising_series(20);
        let rsi = IndicatorEngine::rsi(&closes, 14).unwrap();
        assert!((rsi.last().unwrap() - 100.0).abs() < 0.1);
    }

    #[test]
    fn macd_lines_are_equal_length() {
        let closes = rising_series(60);
        let (macd, signal) = IndicatorEngine::macd(&closes).unwrap();
        assert_eq!(macd.len() - signal.len() + 1, macd.len() - signal.len() + 1);
        assert!(!signal.is_empty());
    }

    #[test]
    fn atr_requires_equal_length_arrays() {
        let highs = vec![1.0, 2.0];
        let lows = vec![1.0];
        let closes = vec![1.0, 2.0];
        assert!(IndicatorEngine::atr(&highs, &lows, &closes, 3).is_err());
    }
}
