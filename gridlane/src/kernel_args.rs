use crate::device::{ByteOrder, Device};

/// One kernel argument as passed by the launch planner
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Address of the plan's kernel stack frame
    KernelContext,
    /// Device address of a buffer
    Buffer(u64),
    I8(i8),
    I16(i16),
    U16(u16),
    I32(i32),
    I64(i64),
    F16(half::f16),
    F32(f32),
    F64(f64),
}

impl KernelArg {
    /// Argument widened to one 64 bit slot
    pub fn slot(self, context_address: u64) -> u64 {
        match self {
            KernelArg::KernelContext => context_address,
            KernelArg::Buffer(address) => address,
            KernelArg::I8(x) => i64::from(x) as u64,
            KernelArg::I16(x) => i64::from(x) as u64,
            KernelArg::U16(x) => u64::from(x),
            KernelArg::I32(x) => i64::from(x) as u64,
            KernelArg::I64(x) => x as u64,
            KernelArg::F16(x) => u64::from(x.to_bits()),
            KernelArg::F32(x) => u64::from(x.to_bits()),
            KernelArg::F64(x) => x.to_bits(),
        }
    }
}

/// Writes the argument blob, the kernel context address followed by one slot per argument
pub fn marshal(args: &[KernelArg], context_address: u64, byte_order: ByteOrder) -> Vec<u8> {
    let mut blob = Vec::with_capacity(Device::ARG_SLOT_BYTES * (args.len() + 1));
    let slots = std::iter::once(context_address).chain(args.iter().map(|arg| arg.slot(context_address)));
    for slot in slots {
        match byte_order {
            ByteOrder::LittleEndian => blob.extend_from_slice(&slot.to_le_bytes()),
            ByteOrder::BigEndian => blob.extend_from_slice(&slot.to_be_bytes()),
        }
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(blob: &[u8]) -> Vec<u64> {
        blob.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn layout_is_context_then_arguments() {
        let args = [KernelArg::Buffer(0x1000_0100), KernelArg::KernelContext, KernelArg::I32(7)];
        let blob = marshal(&args, 0xdead_0000, ByteOrder::LittleEndian);
        assert_eq!(blob.len(), 8 + 8 * args.len());
        assert_eq!(slots(&blob), [0xdead_0000, 0x1000_0100, 0xdead_0000, 7]);
    }

    #[test]
    fn integers_are_extended() {
        let args = [KernelArg::I8(-1), KernelArg::I16(-2), KernelArg::U16(u16::MAX), KernelArg::I64(-3)];
        let blob = marshal(&args, 0, ByteOrder::LittleEndian);
        assert_eq!(slots(&blob)[1..], [u64::MAX, u64::MAX - 1, 0xffff, u64::MAX - 2]);
    }

    #[test]
    fn floats_keep_their_bits() {
        let args = [KernelArg::F32(1.5), KernelArg::F64(-0.25), KernelArg::F16(half::f16::from_f32(2.0))];
        let blob = marshal(&args, 0, ByteOrder::LittleEndian);
        assert_eq!(slots(&blob)[1..], [u64::from(1.5f32.to_bits()), (-0.25f64).to_bits(), 0x4000]);
    }

    #[test]
    fn big_endian_device() {
        let blob = marshal(&[KernelArg::I32(1)], 0x0102, ByteOrder::BigEndian);
        assert_eq!(blob[..8], [0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(blob[8..], [0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
