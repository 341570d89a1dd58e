// device.rs

use crate::error::OpError;

/// Produces one slot's worth of data per iteration.
///
/// The op may only have *issued* the work when `compute` returns; the
/// transfer op is responsible for making the data visible on the host.
pub trait ComputeOp: Send {
    /// Fill the initial source slot before the first iteration.
    fn init(&mut self, dest: &mut [u8], items: usize) -> Result<(), OpError> {
        let _ = items;
        dest.fill(0);
        Ok(())
    }

    /// Generate iteration `iteration` into `dest`, reading the previous
    /// iteration's output (or the seed) from `source`.
    fn compute(
        &mut self,
        iteration: u64,
        source: &[u8],
        dest: &mut [u8],
        items: usize,
    ) -> Result<(), OpError>;
}

/// Moves a produced slot into host memory.
pub trait TransferOp: Send {
    /// Copy `device` into `host`. The bytes must be visible in `host` once
    /// this returns `Ok`.
    fn transfer(
        &mut self,
        iteration: u64,
        device: &[u8],
        host: &mut [u8],
        items: usize,
    ) -> Result<(), OpError>;
}

/// Transfer for slots that already live in host memory: a plain copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostTransfer;

impl HostTransfer {
    pub fn new() -> Self {
        Self
    }
}

impl TransferOp for HostTransfer {
    fn transfer(
        &mut self,
        _iteration: u64,
        device: &[u8],
        host: &mut [u8],
        _items: usize,
    ) -> Result<(), OpError> {
        if device.len() != host.len() {
            return Err(OpError::SizeMismatch {
                expected: device.len(),
                actual: host.len(),
            });
        }
        host.copy_from_slice(device);
        Ok(())
    }
}

/// splitmix64 finalizer, used to spread per-item seeds.
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// One xorshift64* step. Zero is not a valid state and is remapped.
pub fn xorshift64_star(state: u64) -> u64 {
    let mut x = if state == 0 { 0x9E37_79B9_7F4A_7C15 } else { state };
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Pseudo-random generator over 8-byte items.
///
/// `init` derives one seed per item from its index; every iteration advances
/// each item independently from the previous slot. Items are written as
/// little-endian `u64`.
#[derive(Debug, Clone)]
pub struct XorShiftCompute {
    seed: u64,
}

impl XorShiftCompute {
    pub const ITEM_WIDTH: usize = 8;

    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn check_len(len: usize, items: usize) -> Result<(), OpError> {
        let expected = items.saturating_mul(Self::ITEM_WIDTH);
        if len != expected {
            return Err(OpError::SizeMismatch { expected, actual: len });
        }
        Ok(())
    }
}

impl Default for XorShiftCompute {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ComputeOp for XorShiftCompute {
    fn init(&mut self, dest: &mut [u8], items: usize) -> Result<(), OpError> {
        Self::check_len(dest.len(), items)?;
        for (index, item) in dest.chunks_exact_mut(Self::ITEM_WIDTH).enumerate() {
            let value = splitmix64(self.seed ^ index as u64);
            item.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn compute(
        &mut self,
        _iteration: u64,
        source: &[u8],
        dest: &mut [u8],
        items: usize,
    ) -> Result<(), OpError> {
        Self::check_len(source.len(), items)?;
        Self::check_len(dest.len(), items)?;

        let mut word = [0u8; 8];
        for (src, dst) in source
            .chunks_exact(Self::ITEM_WIDTH)
            .zip(dest.chunks_exact_mut(Self::ITEM_WIDTH))
        {
            word.copy_from_slice(src);
            let next = xorshift64_star(u64::from_le_bytes(word));
            dst.copy_from_slice(&next.to_le_bytes());
        }
        Ok(())
    }
}
