use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn sub(&self, delta: u64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulates wall-clock seconds reported by workers (count / total / max).
///
/// Worker processing times arrive as `f64` seconds over the wire, so this
/// stores raw bit patterns rather than `Duration`s.
#[derive(Debug, Default)]
pub struct SecondsAgg {
    count: AtomicU64,
    total_bits: AtomicU64,
    max_bits: AtomicU64,
}

impl SecondsAgg {
    pub fn record(&self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut prev = self.total_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(prev) + seconds).to_bits();
            match self.total_bits.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => prev = cur,
            }
        }

        let mut prev = self.max_bits.load(Ordering::Relaxed);
        while seconds > f64::from_bits(prev) {
            match self.max_bits.compare_exchange_weak(
                prev,
                seconds.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => prev = cur,
            }
        }
    }

    pub fn snapshot(&self) -> SecondsAggSnapshot {
        SecondsAggSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total: f64::from_bits(self.total_bits.load(Ordering::Relaxed)),
            max: f64::from_bits(self.max_bits.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecondsAggSnapshot {
    pub count: u64,
    pub total: f64,
    pub max: f64,
}

impl SecondsAggSnapshot {
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge() {
        let c = Counter::default();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::default();
        g.set(7);
        assert_eq!(g.add(3), 10);
        g.sub(2);
        assert_eq!(g.get(), 8);
    }

    #[test]
    fn seconds_agg_tracks_total_and_max() {
        let agg = SecondsAgg::default();
        agg.record(1.5);
        agg.record(0.5);
        agg.record(f64::NAN); // ignored
        let snap = agg.snapshot();
        assert_eq!(snap.count, 2);
        assert!((snap.total - 2.0).abs() < 1e-9);
        assert!((snap.max - 1.5).abs() < 1e-9);
        assert!((snap.avg() - 1.0).abs() < 1e-9);
    }
}
