//! Instance price history and the running cost of a container.

use chrono::{DateTime, Utc};
use pkg_logging::ThrottledLogger;
use pkg_types::instance::{InstancePrice, InstanceType};
use std::path::Path;

/// Newest-first price changes, plus the dispatcher's flat price for when
/// there is no history at all.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    prices: Vec<InstancePrice>,
    flat_price: f64,
    start: DateTime<Utc>,
}

/// Sort newest first and drop entries that don't change anything.
pub fn normalize(mut prices: Vec<InstancePrice>) -> Vec<InstancePrice> {
    prices.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    prices.dedup_by(|later, earlier| later.start_time == earlier.start_time);
    let mut out: Vec<InstancePrice> = Vec::with_capacity(prices.len());
    for (i, p) in prices.iter().enumerate() {
        if prices.get(i + 1).is_some_and(|older| older.price == p.price) {
            continue;
        }
        out.push(*p);
    }
    out
}

/// `%#.3g`-style: three significant digits, trailing zeros kept.
fn format_price(p: f64) -> String {
    if p == 0.0 || !p.is_finite() {
        return format!("{:.2}", p);
    }
    let magnitude = p.abs().log10().floor() as i32;
    let decimals = (2 - magnitude).max(0) as usize;
    format!("{:.*}", decimals, p)
}

impl PriceHistory {
    /// `instance_type` is the raw `$InstanceType` JSON, if any.
    pub fn new(instance_type: Option<&str>, start: DateTime<Utc>) -> Self {
        let flat_price = instance_type
            .and_then(|j| serde_json::from_str::<InstanceType>(j).ok())
            .map(|it| it.price)
            .filter(|p| *p > 0.0)
            .unwrap_or(0.0);
        Self {
            prices: Vec::new(),
            flat_price,
            start,
        }
    }

    pub fn prices(&self) -> &[InstancePrice] {
        &self.prices
    }

    /// Merge price changes from the dispatcher's prices file, logging the
    /// ones that are new. A missing file is not an error.
    pub fn load(&mut self, path: &Path, log: &ThrottledLogger) {
        let buf = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                log.println(format!("loadPrices: read: {}", e));
                return;
            }
        };
        let loaded: Vec<InstancePrice> = match serde_json::from_slice(&buf) {
            Ok(p) => p,
            Err(e) => {
                log.println(format!("loadPrices: decode: {}", e));
                return;
            }
        };
        let last_known = self.prices.first().map(|p| p.start_time);
        let mut merged = loaded;
        merged.extend(self.prices.iter().copied());
        self.prices = normalize(merged);
        for p in self.prices.iter().rev() {
            if last_known.is_none_or(|t| p.start_time > t) {
                log.println(format!(
                    "Instance price changed to {} at {}",
                    format_price(p.price),
                    p.start_time.format("%Y-%m-%d %H:%M:%S UTC")
                ));
            }
        }
    }

    /// Cost from the start of the run until `now`.
    pub fn cost(&self, now: DateTime<Utc>) -> f64 {
        let mut prices = self.prices.clone();
        match prices.last().copied() {
            None => prices.push(InstancePrice {
                start_time: DateTime::<Utc>::MIN_UTC,
                price: self.flat_price,
            }),
            Some(earliest) if earliest.start_time > self.start => {
                // Assume the earliest known price applied before it too.
                prices.push(InstancePrice {
                    start_time: DateTime::<Utc>::MIN_UTC,
                    price: earliest.price,
                });
            }
            Some(_) => {}
        }

        let mut cost = 0.0;
        let mut span_end = now;
        for p in prices {
            let mut span_start = p.start_time;
            if span_start > now {
                continue;
            }
            let last = span_start < self.start;
            if last {
                span_start = self.start;
            }
            let secs = (span_end - span_start).num_milliseconds() as f64 / 1000.0;
            cost += p.price * secs / 3600.0;
            if last {
                break;
            }
            span_end = span_start;
        }
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::MemorySink;
    use chrono::TimeZone;
    use pkg_logging::ThrottleParams;
    use std::sync::Arc;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn price(hour: u32, price: f64) -> InstancePrice {
        InstancePrice {
            start_time: at(hour),
            price,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_flat_price_from_instance_type() {
        let h = PriceHistory::new(Some(r#"{"Name":"m5","Price":0.5}"#), at(10));
        assert!(close(h.cost(at(12)), 1.0));
        let h = PriceHistory::new(Some("not json"), at(10));
        assert_eq!(h.cost(at(12)), 0.0);
        let h = PriceHistory::new(None, at(10));
        assert_eq!(h.cost(at(12)), 0.0);
    }

    #[test]
    fn test_cost_over_price_changes() {
        let mut h = PriceHistory::new(Some(r#"{"Price":100}"#), at(10));
        h.prices = normalize(vec![price(9, 1.0), price(12, 2.0)]);
        // 10-12 at 1.0, 12-13 at 2.0
        assert!(close(h.cost(at(13)), 4.0));

        // Earliest known price is assumed to have applied since the start.
        h.prices = vec![price(11, 3.0)];
        assert!(close(h.cost(at(12)), 6.0));

        // Prices from the future are ignored.
        h.prices = normalize(vec![price(9, 1.0), price(20, 50.0)]);
        assert!(close(h.cost(at(11)), 1.0));
    }

    #[test]
    fn test_normalize() {
        let got = normalize(vec![price(9, 1.0), price(11, 1.0), price(10, 2.0), price(10, 2.0), price(12, 1.0)]);
        assert_eq!(got, vec![price(11, 1.0), price(10, 2.0), price(9, 1.0)]);
        assert_eq!(normalize(vec![price(1, 1.0), price(2, 1.0)]), vec![price(1, 1.0)]);
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(1.0), "1.00");
        assert_eq!(format_price(0.5), "0.500");
        assert_eq!(format_price(12.34), "12.3");
        assert_eq!(format_price(0.0), "0.00");
    }

    #[tokio::test]
    async fn test_load_logs_new_prices() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("crunch-run-prices.json");
        let sink = Arc::new(MemorySink::default());
        let log = ThrottledLogger::new(sink.clone(), &ThrottleParams::default());
        let mut h = PriceHistory::new(None, at(8));

        h.load(&path, &log);
        assert!(h.prices().is_empty());

        std::fs::write(&path, serde_json::to_vec(&[price(9, 1.0), price(10, 2.0)]).unwrap()).unwrap();
        h.load(&path, &log);
        std::fs::write(&path, serde_json::to_vec(&[price(11, 3.0)]).unwrap()).unwrap();
        h.load(&path, &log);
        assert_eq!(h.prices().len(), 3);

        std::fs::write(&path, b"{bad").unwrap();
        h.load(&path, &log);

        log.close().await.unwrap();
        let text = sink.text();
        let changes: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split_once(' ').map(|(_, m)| m))
            .collect();
        assert_eq!(
            changes[..3],
            [
                "Instance price changed to 1.00 at 2024-03-01 09:00:00 UTC",
                "Instance price changed to 2.00 at 2024-03-01 10:00:00 UTC",
                "Instance price changed to 3.00 at 2024-03-01 11:00:00 UTC",
            ]
        );
        assert!(changes[3].starts_with("loadPrices: decode:"));
    }
}
