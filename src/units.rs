//! Minimal unit newtypes.
//!
//! The rest of the data model uses plain `f64` for energy/power; these two
//! newtypes only exist where mixing up joules and watts would be an easy, silent mistake
//! (accumulation and integration in [`crate::counter`] and
//! [`crate::correlator`]).

use std::ops::{Add, Sub};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, serde::Serialize, serde::Deserialize)]
pub struct Joules(pub f64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, serde::Serialize, serde::Deserialize)]
pub struct Watts(pub f64);

impl Add for Joules {
    type Output = Joules;
    fn add(self, rhs: Joules) -> Joules {
        Joules(self.0 + rhs.0)
    }
}

impl Sub for Joules {
    type Output = Joules;
    fn sub(self, rhs: Joules) -> Joules {
        Joules(self.0 - rhs.0)
    }
}

impl Joules {
    /// Average power over `duration_secs`, or `0.0` for a non-positive duration.
    pub fn over(self, duration_secs: f64) -> Watts {
        if duration_secs > 0.0 {
            Watts(self.0 / duration_secs)
        } else {
            Watts(0.0)
        }
    }
}
