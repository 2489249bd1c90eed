use std::sync::atomic::{AtomicBool, Ordering};

/// Energy price collaborator.
pub trait PriceSignal: Send + Sync {
    /// Whether charging `client_id` now fits in its cheapest `required_cheap_hours`.
    fn is_price_acceptable(&self, client_id: &str, required_cheap_hours: u32) -> bool;
}

/// Price signal switched from outside, the same answer for every station.
#[derive(Debug, Default)]
pub struct StaticPriceSignal {
    acceptable: AtomicBool,
}

impl StaticPriceSignal {
    pub fn new(acceptable: bool) -> Self {
        StaticPriceSignal {
            acceptable: AtomicBool::new(acceptable),
        }
    }

    pub fn set(&self, acceptable: bool) {
        self.acceptable.store(acceptable, Ordering::Relaxed);
    }

    pub fn get(&self) -> bool {
        self.acceptable.load(Ordering::Relaxed)
    }
}

impl PriceSignal for StaticPriceSignal {
    fn is_price_acceptable(&self, _client_id: &str, _required_cheap_hours: u32) -> bool {
        self.get()
    }
}
