//! Label/patch assembler for the hand-assembled helper routines.
//!
//! The loop-heavy helpers are easier to express with named branch targets
//! than with pre-computed distances. `label` records the current word index,
//! `b_to`/`cbz_w_to` emit a placeholder and record a patch, and `resolve`
//! rewrites each placeholder from the word-index delta between patch site
//! and target.

use std::collections::HashMap;

use super::encode;

/// A pending branch awaiting its target label.
struct Patch {
    /// Word index of the placeholder instruction.
    index: usize,
    /// Target label name.
    target: &'static str,
    kind: PatchKind,
}

enum PatchKind {
    B,
    CbzW { reg: u8 },
}

/// An instruction-word buffer with forward-reference labels.
#[derive(Default)]
pub struct Assembler {
    words: Vec<u32>,
    labels: HashMap<&'static str, usize>,
    patches: Vec<Patch>,
}

impl Assembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fully-encoded instruction word.
    pub fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Binds `name` to the current word index.
    pub fn label(&mut self, name: &'static str) {
        let previous = self.labels.insert(name, self.words.len());
        assert!(previous.is_none(), "label {name:?} bound twice");
    }

    /// Emits a `B` to `name`, patched at resolve time.
    pub fn b_to(&mut self, name: &'static str) {
        self.patches.push(Patch {
            index: self.words.len(),
            target: name,
            kind: PatchKind::B,
        });
        self.words.push(0);
    }

    /// Emits a `CBZ Wreg` to `name`, patched at resolve time.
    pub fn cbz_w_to(&mut self, reg: u8, name: &'static str) {
        self.patches.push(Patch {
            index: self.words.len(),
            target: name,
            kind: PatchKind::CbzW { reg },
        });
        self.words.push(0);
    }

    /// Number of words emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns true if nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Resolves all patches and returns the finished instruction words.
    ///
    /// # Panics
    ///
    /// Panics on a branch to a label that was never bound.
    pub fn resolve(mut self) -> Vec<u32> {
        for patch in &self.patches {
            let target_index = *self
                .labels
                .get(patch.target)
                .unwrap_or_else(|| panic!("unresolved label {:?}", patch.target));
            let delta = target_index as i64 - patch.index as i64;
            let delta = i32::try_from(delta).expect("branch delta overflows i32");
            self.words[patch.index] = match patch.kind {
                PatchKind::B => encode::b(delta),
                PatchKind::CbzW { reg } => encode::cbz32(reg, delta),
            };
        }
        self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::decode::disassemble;

    #[test]
    fn test_forward_branch() {
        let mut asm = Assembler::new();
        asm.cbz_w_to(5, "done");
        asm.emit(encode::movz64(0, 1, 0));
        asm.label("done");
        asm.emit(encode::ret());

        let words = asm.resolve();
        assert_eq!(words.len(), 3);
        assert_eq!(words[0], encode::cbz32(5, 2));
        assert_eq!(words[2], encode::ret());
    }

    #[test]
    fn test_backward_branch() {
        let mut asm = Assembler::new();
        asm.label("loop");
        asm.emit(encode::add_imm32(2, 2, 1, 0));
        asm.b_to("loop");

        let words = asm.resolve();
        assert_eq!(words[1], encode::b(-1));
        assert_eq!(disassemble(words[1]), "b #-0x4");
    }

    #[test]
    #[should_panic(expected = "unresolved label")]
    fn test_unresolved_label_panics() {
        let mut asm = Assembler::new();
        asm.b_to("nowhere");
        asm.resolve();
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_duplicate_label_panics() {
        let mut asm = Assembler::new();
        asm.label("x");
        asm.label("x");
    }
}
