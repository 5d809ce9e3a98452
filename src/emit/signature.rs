//! Embedded code signature: a superblob holding one SHA-256 CodeDirectory.
//!
//! All multi-byte fields in signature blobs are big-endian, unlike the rest
//! of the Mach-O. The directory hashes the signed region in 4 KiB pages;
//! the signer never re-hashes its own output, so the input slice must be
//! the complete, final signed region.

use sha2::{Digest, Sha256};

use crate::emit::buffer::ByteBuffer;
use crate::emit::{CODE_LIMIT, PAGE_SIZE_4K, SIGNATURE_SIZE};
use crate::macho::{
    CSMAGIC_CODEDIRECTORY, CSMAGIC_EMBEDDED_SIGNATURE, CSSLOT_CODEDIRECTORY,
    CS_FLAGS_ADHOC_LINKER_SIGNED, CS_HASHTYPE_SHA256, CS_VERSION_2_4,
};

/// Byte offset of the identifier string within the CodeDirectory.
const IDENT_OFFSET: usize = 88;

/// SHA-256 digest length.
const HASH_SIZE: usize = 32;

/// log2 of the hash page size.
const PAGE_SHIFT: u8 = 12;

/// Builds the 408-byte code-signature superblob over the signed region.
///
/// # Panics
///
/// Panics if `image` is not exactly the signed region.
pub fn build_code_signature(image: &[u8], identifier: &str) -> Vec<u8> {
    assert_eq!(image.len(), CODE_LIMIT, "signer requires the complete signed region");

    let n_code_slots = CODE_LIMIT.div_ceil(PAGE_SIZE_4K);
    let hash_offset = IDENT_OFFSET + identifier.len() + 1;
    let cd_len = hash_offset + n_code_slots * HASH_SIZE;

    // CodeDirectory, big-endian throughout.
    let mut cd = ByteBuffer::with_capacity(cd_len);
    cd.push_u32_be(CSMAGIC_CODEDIRECTORY);
    cd.push_u32_be(cd_len as u32);
    cd.push_u32_be(CS_VERSION_2_4);
    cd.push_u32_be(CS_FLAGS_ADHOC_LINKER_SIGNED);
    cd.push_u32_be(hash_offset as u32);
    cd.push_u32_be(IDENT_OFFSET as u32);
    cd.push_u32_be(0); // nSpecialSlots
    cd.push_u32_be(n_code_slots as u32);
    cd.push_u32_be(CODE_LIMIT as u32);
    cd.push_u8(HASH_SIZE as u8);
    cd.push_u8(CS_HASHTYPE_SHA256);
    cd.push_u8(0); // platform
    cd.push_u8(PAGE_SHIFT);
    cd.push_u32_be(0); // spare2
    cd.push_u32_be(0); // scatterOffset
    cd.push_u32_be(0); // teamOffset

    cd.pad_to(76);
    cd.push_u32_be(0x1C);
    cd.push_u32_be(0x0);
    cd.push_u32_be(0x1);
    assert_eq!(cd.len(), IDENT_OFFSET);

    cd.push_cstr(identifier);
    assert_eq!(cd.len(), hash_offset);

    for page in image.chunks(PAGE_SIZE_4K) {
        let digest = Sha256::digest(page);
        cd.push_bytes(&digest);
    }
    assert_eq!(cd.len(), cd_len);

    // Superblob wrapper with a single CodeDirectory slot.
    let mut superblob = ByteBuffer::with_capacity(SIGNATURE_SIZE);
    superblob.push_u32_be(CSMAGIC_EMBEDDED_SIGNATURE);
    superblob.push_u32_be((20 + cd_len) as u32);
    superblob.push_u32_be(1); // blob count
    superblob.push_u32_be(CSSLOT_CODEDIRECTORY);
    superblob.push_u32_be(20); // CodeDirectory offset
    superblob.push_bytes(cd.as_slice());

    superblob.pad_to(SIGNATURE_SIZE);
    let out = superblob.into_vec();
    assert_eq!(out.len(), SIGNATURE_SIZE);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_region() -> Vec<u8> {
        let mut region = vec![0u8; CODE_LIMIT];
        for (i, byte) in region.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        region
    }

    #[test]
    fn test_superblob_framing() {
        let sig = build_code_signature(&signed_region(), "test_ir.x");
        assert_eq!(sig.len(), SIGNATURE_SIZE);

        assert_eq!(&sig[..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        // One slot, CodeDirectory at offset 20.
        assert_eq!(&sig[8..12], &1u32.to_be_bytes());
        assert_eq!(&sig[12..16], &CSSLOT_CODEDIRECTORY.to_be_bytes());
        assert_eq!(&sig[16..20], &20u32.to_be_bytes());
        assert_eq!(&sig[20..24], &CSMAGIC_CODEDIRECTORY.to_be_bytes());
    }

    #[test]
    fn test_code_directory_fields() {
        let ident = "test_ir.x";
        let sig = build_code_signature(&signed_region(), ident);
        let cd = &sig[20..];

        let hash_offset = IDENT_OFFSET + ident.len() + 1;
        let n_slots = CODE_LIMIT.div_ceil(PAGE_SIZE_4K);
        assert_eq!(
            &cd[4..8],
            &((hash_offset + n_slots * HASH_SIZE) as u32).to_be_bytes()
        );
        assert_eq!(&cd[8..12], &CS_VERSION_2_4.to_be_bytes());
        assert_eq!(&cd[16..20], &(hash_offset as u32).to_be_bytes());
        assert_eq!(&cd[20..24], &(IDENT_OFFSET as u32).to_be_bytes());
        assert_eq!(&cd[28..32], &(n_slots as u32).to_be_bytes());
        assert_eq!(&cd[32..36], &(CODE_LIMIT as u32).to_be_bytes());
        assert_eq!(cd[36], HASH_SIZE as u8);
        assert_eq!(cd[37], CS_HASHTYPE_SHA256);
        assert_eq!(cd[39], PAGE_SHIFT);

        // Identifier is NUL-terminated at its stated offset.
        assert_eq!(&cd[IDENT_OFFSET..IDENT_OFFSET + ident.len()], ident.as_bytes());
        assert_eq!(cd[IDENT_OFFSET + ident.len()], 0);
    }

    #[test]
    fn test_page_hashes() {
        let region = signed_region();
        let ident = "test.x";
        let sig = build_code_signature(&region, ident);
        let hash_base = 20 + IDENT_OFFSET + ident.len() + 1;

        // First page and the short last page.
        let first = Sha256::digest(&region[..PAGE_SIZE_4K]);
        assert_eq!(&sig[hash_base..hash_base + 32], first.as_slice());

        let n_slots = CODE_LIMIT.div_ceil(PAGE_SIZE_4K);
        let last_start = (n_slots - 1) * PAGE_SIZE_4K;
        let last = Sha256::digest(&region[last_start..]);
        let last_off = hash_base + (n_slots - 1) * 32;
        assert_eq!(&sig[last_off..last_off + 32], last.as_slice());
    }

    #[test]
    #[should_panic(expected = "complete signed region")]
    fn test_wrong_length_panics() {
        build_code_signature(&[0u8; 100], "test.x");
    }
}
