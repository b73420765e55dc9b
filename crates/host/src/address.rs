//! Device address pool
//!
//! Addresses 1..=127 per controller. Allocation walks round-robin from the
//! last address handed out so a freshly released address is not reused
//! immediately.

use common::{Error, Result};

pub const MAX_ADDRESS: u8 = 127;

#[derive(Debug)]
pub struct AddressPool {
    /// Bit n set when address n is in use; bit 0 (the default address) never set
    used: u128,
    last: u8,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPool {
    pub fn new() -> Self {
        Self { used: 0, last: 0 }
    }

    /// Hand out the next free address
    pub fn allocate(&mut self) -> Result<u8> {
        for step in 1..=MAX_ADDRESS {
            let candidate = (self.last + step - 1) % MAX_ADDRESS + 1;
            if !self.in_use(candidate) {
                self.used |= 1 << candidate;
                self.last = candidate;
                return Ok(candidate);
            }
        }
        Err(Error::AddressExhausted)
    }

    /// Return an address; releasing a free address is a no-op
    pub fn release(&mut self, address: u8) {
        if (1..=MAX_ADDRESS).contains(&address) {
            self.used &= !(1 << address);
        }
    }

    pub fn in_use(&self, address: u8) -> bool {
        address <= MAX_ADDRESS && self.used & (1 << address) != 0
    }

    pub fn allocated(&self) -> usize {
        self.used.count_ones() as usize
    }
}
