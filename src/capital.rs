//! Shared available-capital pool for live trading
//!
//! The only state shared between assets. Every read-modify-write happens under
//! one lock so concurrent ticks cannot both spend the same cash.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, TradingError};

#[derive(Debug, Clone)]
pub struct CapitalPool {
    available: Arc<Mutex<f64>>,
}

impl CapitalPool {
    pub fn new(initial: f64) -> Self {
        Self {
            available: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, f64> {
        // a poisoned f64 is still a valid balance
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn available(&self) -> f64 {
        *self.lock()
    }

    /// Set `amount` aside for an order
    pub fn try_reserve(&self, amount: f64) -> Result<()> {
        let mut available = self.lock();
        if amount > *available {
            return Err(TradingError::InsufficientFunds {
                requested: amount,
                available: *available,
            });
        }
        *available -= amount;
        Ok(())
    }

    /// Return an unused reservation
    pub fn release(&self, amount: f64) {
        *self.lock() += amount;
    }

    /// Replace a reservation with what the fill actually cost
    pub fn settle(&self, reserved: f64, spent: f64) {
        *self.lock() += reserved - spent;
    }

    /// Add sale proceeds
    pub fn credit(&self, amount: f64) {
        *self.lock() += amount;
    }
}
