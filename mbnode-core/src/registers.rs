//! Holding and input register storage shared by the increment loop and the
//! Modbus responder

use crate::config::{HOLDING_REG_COUNT, INPUT_REG_COUNT};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegisterKind {
    /// Read/write from the client's side
    Holding,
    /// Read-only from the client's side
    Input,
}

#[derive(Debug)]
struct Blocks {
    holding: Box<[u16]>,
    input: Box<[u16]>,
}

impl Blocks {
    fn block(&self, kind: RegisterKind) -> &[u16] {
        match kind {
            RegisterKind::Holding => &self.holding,
            RegisterKind::Input => &self.input,
        }
    }

    fn block_mut(&mut self, kind: RegisterKind) -> &mut [u16] {
        match kind {
            RegisterKind::Holding => &mut self.holding,
            RegisterKind::Input => &mut self.input,
        }
    }
}

/// Two fixed-length register blocks behind one short critical section.
///
/// Block lengths never change after construction. Every access holds the
/// lock only for a bounded copy or scan and never blocks inside it.
#[derive(Debug)]
pub struct RegisterBank {
    blocks: Mutex<Blocks>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::with_counts(HOLDING_REG_COUNT, INPUT_REG_COUNT)
    }

    pub fn with_counts(holding: usize, input: usize) -> Self {
        Self {
            blocks: Mutex::new(Blocks {
                holding: vec![0; holding].into_boxed_slice(),
                input: vec![0; input].into_boxed_slice(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Blocks> {
        // A panicking holder cannot leave a half-written u16 behind.
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self, kind: RegisterKind) -> usize {
        self.lock().block(kind).len()
    }

    pub fn is_empty(&self, kind: RegisterKind) -> bool {
        self.len(kind) == 0
    }

    /// Add `holding_step` to every holding register and `input_step` to every
    /// input register, wrapping at 16 bits, as one atomic update.
    pub fn increment(&self, holding_step: u16, input_step: u16) {
        let mut blocks = self.lock();
        for value in blocks.holding.iter_mut() {
            *value = value.wrapping_add(holding_step);
        }
        for value in blocks.input.iter_mut() {
            *value = value.wrapping_add(input_step);
        }
    }

    /// Copy `out.len()` registers starting at `index`. Returns false, leaving
    /// `out` untouched, when the range is outside the block.
    pub fn read(&self, kind: RegisterKind, index: usize, out: &mut [u16]) -> bool {
        let blocks = self.lock();
        match blocks.block(kind).get(index..index + out.len()) {
            Some(values) => {
                out.copy_from_slice(values);
                true
            }
            None => false,
        }
    }

    /// Store `values` starting at `index`. Returns false, writing nothing,
    /// when the range is outside the block.
    pub fn write(&self, kind: RegisterKind, index: usize, values: &[u16]) -> bool {
        let mut blocks = self.lock();
        match blocks.block_mut(kind).get_mut(index..index + values.len()) {
            Some(slots) => {
                slots.copy_from_slice(values);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, kind: RegisterKind, index: usize) -> Option<u16> {
        self.lock().block(kind).get(index).copied()
    }

    pub fn snapshot(&self, kind: RegisterKind) -> Vec<u16> {
        self.lock().block(kind).to_vec()
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increments_wrap_at_16_bits() {
        let bank = RegisterBank::with_counts(2, 2);
        bank.write(RegisterKind::Holding, 0, &[u16::MAX, 7]);
        bank.write(RegisterKind::Input, 0, &[u16::MAX - 2, 0]);
        bank.increment(1, 5);
        assert_eq!(bank.snapshot(RegisterKind::Holding), vec![0, 8]);
        assert_eq!(bank.snapshot(RegisterKind::Input), vec![2, 5]);
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let bank = RegisterBank::new();
        let mut out = [0xaaaa; 3];
        assert!(!bank.read(RegisterKind::Input, 48, &mut out));
        assert_eq!(out, [0xaaaa; 3]);
        assert!(!bank.write(RegisterKind::Holding, 50, &[1]));
        assert!(bank.read(RegisterKind::Input, 47, &mut out));
        assert_eq!(bank.get(RegisterKind::Holding, 50), None);
    }

    #[test]
    fn default_blocks_have_fifty_registers() {
        let bank = RegisterBank::default();
        assert_eq!(bank.len(RegisterKind::Holding), 50);
        assert_eq!(bank.len(RegisterKind::Input), 50);
    }

    // Readers racing the increment never see a torn block: within one read all
    // values belong to the same increment count.
    #[test]
    fn concurrent_reads_see_whole_increments() {
        let bank = Arc::new(RegisterBank::new());
        let writer = {
            let bank = bank.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    bank.increment(1, 5);
                }
            })
        };

        let mut holding = [0u16; 50];
        let mut input = [0u16; 50];
        for _ in 0..1000 {
            assert!(bank.read(RegisterKind::Holding, 0, &mut holding));
            assert!(holding.iter().all(|&v| v == holding[0]));
            assert!(bank.read(RegisterKind::Input, 0, &mut input));
            assert!(input.iter().all(|&v| v == input[0]));
            assert_eq!(input[0] % 5, 0);
        }

        writer.join().unwrap();
        assert_eq!(bank.get(RegisterKind::Holding, 0), Some(2000));
        assert_eq!(bank.get(RegisterKind::Input, 49), Some(10000));
    }
}
