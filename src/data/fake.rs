/*!
Generate fake tick data, for testing purposes
*/
use super::Tick;
use crate::CpuFloat;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal, NormalError};

/// Generate tick data using a price generator at a fixed bar spacing
#[derive(Debug, Clone)]
pub struct TickGen<P: PriceGen> {
    /// The timestamp of the next tick
    pub t: NaiveDateTime,
    /// The spacing between ticks
    pub step: Duration,
    /// The price generator in use
    pub price_generator: P,
}

/// A trait implemented by price generators
pub trait PriceGen {
    /// Generate the next bar's open, high, low, close and volume
    fn next_bar(&mut self) -> (CpuFloat, CpuFloat, CpuFloat, CpuFloat, u64);
}

/// Generate fake prices using a geometric random walk with log-normal volume
#[derive(Debug, Clone)]
pub struct PriceRandomWalk<R> {
    /// The RNG used by this random walk
    pub rng: R,
    /// The last closing price
    pub price: CpuFloat,
    /// Per-bar return distribution
    pub returns: Normal<CpuFloat>,
    /// Per-bar volume distribution
    pub volume: LogNormal<CpuFloat>,
}

impl<R: Rng> PriceRandomWalk<R> {
    /// Create a random walk starting at `price` with per-bar return volatility `sigma`
    pub fn new(
        rng: R,
        price: CpuFloat,
        sigma: CpuFloat,
    ) -> Result<PriceRandomWalk<R>, NormalError> {
        Ok(PriceRandomWalk {
            rng,
            price,
            returns: Normal::new(0.0, sigma)?,
            volume: LogNormal::new(7.0, 0.5)?,
        })
    }
}

impl<R: Rng> PriceGen for PriceRandomWalk<R> {
    fn next_bar(&mut self) -> (CpuFloat, CpuFloat, CpuFloat, CpuFloat, u64) {
        let open = self.price;
        let close = (open * (1.0 + self.returns.sample(&mut self.rng))).max(0.01);
        let wick: CpuFloat = self.rng.gen_range(0.0..0.002);
        let high = open.max(close) * (1.0 + wick);
        let low = open.min(close) * (1.0 - wick);
        let volume = self.volume.sample(&mut self.rng).round() as u64;
        self.price = close;
        (open, high, low, close, volume)
    }
}

impl<P: PriceGen> Iterator for TickGen<P> {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        let (o, h, l, c, v) = self.price_generator.next_bar();
        let tick = Tick {
            t: self.t,
            o,
            h,
            l,
            c,
            v,
        };
        self.t += self.step;
        Some(tick)
    }
}

/// A reproducible stream of five-minute ticks, for tests and demos
pub fn random_walk_ticks(seed: u64) -> TickGen<PriceRandomWalk<rand::rngs::StdRng>> {
    use rand::SeedableRng;
    let start = NaiveDate::from_ymd_opt(2024, 1, 2)
        .and_then(|day| day.and_hms_opt(9, 30, 0))
        .expect("valid start date");
    let walk = PriceRandomWalk::new(rand::rngs::StdRng::seed_from_u64(seed), 100.0, 0.003)
        .expect("valid random walk parameters");
    TickGen {
        t: start,
        step: Duration::minutes(5),
        price_generator: walk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_walk_is_reproducible_and_ordered() {
        let a: Vec<Tick> = random_walk_ticks(7).take(50).collect();
        let b: Vec<Tick> = random_walk_ticks(7).take(50).collect();
        assert_eq!(a, b);
        for pair in a.windows(2) {
            assert!(pair[0].t < pair[1].t);
            assert_eq!(pair[0].c, pair[1].o);
        }
        for tick in &a {
            assert!(tick.l <= tick.o.min(tick.c) && tick.h >= tick.o.max(tick.c));
            assert!(tick.c > 0.0);
        }
    }
}
