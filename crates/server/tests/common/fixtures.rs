//! Test fixtures for generating test data.

use bytes::Bytes;
use pinfold_archive::MemoryFile;
use pinfold_core::VaultKey;
use serde_json::json;

/// Block size used by test archives.
pub const TEST_BLOCK_SIZE: usize = 1024;

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// A vault key made of one repeated byte.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn vault_key(seed: u8) -> VaultKey {
    VaultKey::from_bytes([seed; 32])
}

/// A `dpack.json` manifest file with the given title.
#[allow(dead_code)]
pub fn manifest_file(title: &str) -> MemoryFile {
    let body = json!({ "title": title, "description": "test vault" });
    MemoryFile::new("/dpack.json", serde_json::to_vec(&body).unwrap())
}

/// A small vault: a manifest plus `data_blocks` full blocks of content
/// spread over two files in a subdirectory.
#[allow(dead_code)]
pub fn sample_files(seed: u64, data_blocks: usize) -> Vec<MemoryFile> {
    let first = data_blocks / 2;
    let second = data_blocks - first;
    vec![
        manifest_file(&format!("vault {seed}")),
        MemoryFile::new(
            "/data/a.bin",
            seeded_bytes(seed, first * TEST_BLOCK_SIZE),
        ),
        MemoryFile::new(
            "/data/b.bin",
            seeded_bytes(seed + 1, second * TEST_BLOCK_SIZE),
        ),
    ]
}
