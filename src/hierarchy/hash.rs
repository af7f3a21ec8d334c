//! Address hashing for bucket selection in the class table.
//!
//! Class identities are addresses of VM class structures. They are aligned, so their low
//! bits carry almost no information and a plain `address % buckets` would crowd a few
//! buckets. [`AddressHash`] mixes every bit of the address into the state using FNV-1a
//! inspired sequential mixing with an extra avalanche step.
//!
//! # Example Usage
//!
//! ```rust
//! use hierscope::hierarchy::AddressHash;
//!
//! let hash = AddressHash::new().add_address(0x7f00_1000).finalize();
//! assert_eq!(hash, AddressHash::new().add_address(0x7f00_1000).finalize());
//! ```

/// Hash builder for class addresses using FNV-1a inspired mixing
///
/// Each component is mixed into the state in a way that preserves order and prevents
/// self-cancellation.
pub struct AddressHash {
    /// Current hash state using FNV-1a algorithm principles
    state: u64,
}

impl AddressHash {
    /// Create a new hash builder
    ///
    /// Initializes with FNV-1a offset basis for good hash distribution
    #[must_use]
    pub fn new() -> Self {
        AddressHash {
            state: 0xcbf2_9ce4_8422_2325_u64, // FNV-1a 64-bit offset basis
        }
    }

    /// Mix a 64-bit value into the hash state using enhanced algorithm with better avalanche
    fn mix(&mut self, value: u64) {
        self.state ^= value;
        self.state = self.state.wrapping_mul(0x0100_0000_01b3_u64); // FNV-1a 64-bit prime

        self.state ^= self.state >> 33;
        self.state = self.state.wrapping_mul(0xff51_afd7_ed55_8ccd_u64);
        self.state ^= self.state >> 33;
    }

    /// Add an address to the hash
    ///
    /// ## Arguments
    /// * `address` - The raw address to include
    #[must_use]
    pub fn add_address(mut self, address: usize) -> Self {
        self.mix(address as u64);
        self
    }

    /// Finalize the hash and return the computed value
    #[must_use]
    pub fn finalize(self) -> u64 {
        self.state
    }

    /// Selects the bucket for `address` in a table of `buckets` entries
    ///
    /// ## Arguments
    /// * `address` - The raw address to place
    /// * `buckets` - Number of buckets, must be non-zero
    #[must_use]
    pub fn bucket(address: usize, buckets: usize) -> usize {
        let hash = AddressHash::new().add_address(address).finalize();
        (hash % buckets as u64) as usize
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::new()
    }
}
