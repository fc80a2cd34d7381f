// Grid price ladder: absolute level indices mapped to tick-aligned prices

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::GridSpacing;

/// Upper bound on ladder size, guards against degenerate spacing
pub const MAX_LEVELS: usize = 1000;

/// A window of `count` consecutive levels starting at absolute index `first`.
///
/// Prices are derived from `origin` (the price of absolute index 0), so a
/// window shifted by whole levels reproduces exactly the same prices for the
/// indices both windows share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    origin: Decimal,
    spacing: GridSpacing,
    tick_size: Decimal,
    first: i64,
    count: usize,
}

impl GridLayout {
    /// Ladder covering [lower, upper], starting at `lower` rounded to the tick
    pub fn from_bounds(lower: Decimal, upper: Decimal, spacing: GridSpacing, tick_size: Decimal) -> Self {
        let mut layout = Self {
            origin: round_to_tick(lower, tick_size),
            spacing,
            tick_size,
            first: 0,
            count: 0,
        };

        let mut count = 0usize;
        while count < MAX_LEVELS {
            match layout.price_at(count as i64) {
                Some(price) if price <= upper => count += 1,
                _ => break,
            }
        }
        layout.count = count;
        layout
    }

    /// Price of an absolute level index, None when it falls to zero or below
    pub fn price_at(&self, index: i64) -> Option<Decimal> {
        let raw = match self.spacing {
            GridSpacing::Arithmetic { step } => self.origin + step * Decimal::from(index),
            GridSpacing::Geometric { ratio } => {
                let factor = Decimal::ONE + ratio;
                let mut price = self.origin;
                if index >= 0 {
                    for _ in 0..index {
                        price = price.checked_mul(factor)?;
                    }
                } else {
                    for _ in 0..index.unsigned_abs() {
                        price = price.checked_div(factor)?;
                    }
                }
                price
            }
        };

        let price = round_to_tick(raw, self.tick_size);
        if price > Decimal::ZERO {
            Some(price)
        } else {
            None
        }
    }

    pub fn level_count(&self) -> usize {
        self.count
    }

    pub fn first_index(&self) -> i64 {
        self.first
    }

    pub fn last_index(&self) -> i64 {
        self.first + self.count as i64 - 1
    }

    pub fn contains(&self, index: i64) -> bool {
        index >= self.first && index <= self.last_index()
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<i64> {
        self.first..=self.last_index()
    }

    pub fn lower_bound(&self) -> Decimal {
        self.price_at(self.first).unwrap_or(Decimal::ZERO)
    }

    pub fn upper_bound(&self) -> Decimal {
        self.price_at(self.last_index()).unwrap_or(Decimal::ZERO)
    }

    pub fn spacing(&self) -> GridSpacing {
        self.spacing
    }

    pub fn prices(&self) -> Vec<Decimal> {
        self.indices().filter_map(|i| self.price_at(i)).collect()
    }

    /// Same window moved by `by` levels
    pub fn shifted(&self, by: i64) -> Self {
        Self {
            first: self.first + by,
            ..self.clone()
        }
    }

    /// Absolute index whose price is closest to `price`
    pub fn nearest_index(&self, price: Decimal) -> i64 {
        let estimate = match self.spacing {
            GridSpacing::Arithmetic { step } => ((price - self.origin) / step)
                .round()
                .to_i64()
                .unwrap_or(self.first),
            GridSpacing::Geometric { ratio } => {
                let relative = (price / self.origin).to_f64().unwrap_or(1.0);
                let factor = (Decimal::ONE + ratio).to_f64().unwrap_or(1.0);
                if relative <= 0.0 || factor <= 1.0 {
                    self.first
                } else {
                    (relative.ln() / factor.ln()).round() as i64
                }
            }
        };

        // Correct the estimate against the rounded prices
        let distance = |i: i64| {
            self.price_at(i)
                .map(|p| (p - price).abs())
                .unwrap_or(Decimal::MAX)
        };
        let mut best = estimate;
        for candidate in [estimate - 1, estimate + 1] {
            if distance(candidate) < distance(best) {
                best = candidate;
            }
        }
        best
    }

    /// Shift that moves the window center onto the level nearest `price`
    pub fn shift_to_center(&self, price: Decimal) -> i64 {
        let center = self.first + (self.count as i64 - 1) / 2;
        self.nearest_index(price) - center
    }
}

/// Round a price to the nearest multiple of `tick`
pub fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    ((value / tick).round() * tick).normalize()
}

/// Round a quantity down to the exchange's step so it never exceeds the intent
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}
