//! Architectural-state snapshots.
//!
//! Only the hart's architectural state is captured (registers, CSRs, FPU,
//! flags). Decoded blocks, the cache, and branch histories are derived
//! state and are rebuilt on demand after a restore.

use thiserror::Error;

use crate::cpu::Cpu;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("state serialization failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("state compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// Serialize and compress the hart state.
pub fn save(cpu: &Cpu) -> Result<Vec<u8>, SnapshotError> {
    let raw = bincode::serialize(cpu)?;
    Ok(zstd::stream::encode_all(&raw[..], 0)?)
}

/// Decompress and deserialize a hart state.
pub fn restore(bytes: &[u8]) -> Result<Cpu, SnapshotError> {
    let raw = zstd::stream::decode_all(bytes)?;
    Ok(bincode::deserialize(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_snapshot_round_trip() {
        let mut cpu = Cpu::new(&Config::default());
        cpu.pc = 0x8000_1234;
        cpu.regs[10] = 42;
        cpu.csr.cycle = 9001;
        cpu.fpu.write_f32(3, 0x3F80_0000);
        cpu.compressed = true;

        let blob = save(&cpu).unwrap();
        assert!(!blob.is_empty());

        let restored = restore(&blob).unwrap();
        assert_eq!(restored.pc, 0x8000_1234);
        assert_eq!(restored.regs[10], 42);
        assert_eq!(restored.csr.cycle, 9001);
        assert_eq!(restored.fpu.fregs[3], 0xFFFF_FFFF_3F80_0000);
        assert!(restored.compressed);
    }

    #[test]
    fn test_restore_garbage_fails() {
        assert!(restore(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
