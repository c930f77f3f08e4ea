use std::collections::VecDeque;

use thiserror::Error;

use crate::error::BindlessError;

use super::ViewKind;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("no free slots remain")]
    Exhausted,
    #[error("slot {index} is outside capacity {capacity}")]
    OutOfRange { index: u32, capacity: u32 },
    #[error("slot {0} is already free")]
    DoubleFree(u32),
}

/// Fixed pool of descriptor indices handed out in FIFO order.
#[derive(Debug, Clone)]
pub struct DescriptorSlotAllocator {
    free: VecDeque<u32>,
    free_bits: Vec<u64>,
    capacity: u32,
}

impl DescriptorSlotAllocator {
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        let mut free_bits = vec![u64::MAX; words];
        let tail = capacity as usize % 64;
        if tail != 0 {
            if let Some(last) = free_bits.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self {
            free: (0..capacity).collect(),
            free_bits,
            capacity,
        }
    }

    pub fn allocate(&mut self) -> Result<u32, SlotError> {
        let index = self.free.pop_front().ok_or(SlotError::Exhausted)?;
        self.set_free_bit(index, false);
        Ok(index)
    }

    pub fn free(&mut self, index: u32) -> Result<(), SlotError> {
        if index >= self.capacity {
            return Err(SlotError::OutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        if self.is_free(index) {
            return Err(SlotError::DoubleFree(index));
        }
        self.set_free_bit(index, true);
        self.free.push_back(index);
        Ok(())
    }

    pub fn is_allocated(&self, index: u32) -> bool {
        index < self.capacity && !self.is_free(index)
    }

    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> u32 {
        self.capacity - self.available()
    }

    fn is_free(&self, index: u32) -> bool {
        let (word, bit) = (index as usize / 64, index % 64);
        self.free_bits[word] & (1u64 << bit) != 0
    }

    fn set_free_bit(&mut self, index: u32, free: bool) {
        let (word, bit) = (index as usize / 64, index % 64);
        if free {
            self.free_bits[word] |= 1u64 << bit;
        } else {
            self.free_bits[word] &= !(1u64 << bit);
        }
    }
}

/// Linear addressing of heap slots: `base + index * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub cpu_base: u64,
    pub gpu_base: u64,
    pub stride: u64,
}

impl HeapLayout {
    /// Slots addressed by index only.
    pub const INDEXED: HeapLayout = HeapLayout {
        cpu_base: 0,
        gpu_base: 0,
        stride: 1,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub index: u32,
    pub kind: ViewKind,
}

#[derive(Debug, Clone)]
pub struct DescriptorHeap {
    kind: ViewKind,
    allocator: DescriptorSlotAllocator,
    layout: HeapLayout,
}

impl DescriptorHeap {
    pub fn new(kind: ViewKind, capacity: u32, layout: HeapLayout) -> Self {
        Self {
            kind,
            allocator: DescriptorSlotAllocator::new(capacity),
            layout,
        }
    }

    pub fn allocate(&mut self) -> Result<DescriptorSlot, BindlessError> {
        match self.allocator.allocate() {
            Ok(index) => Ok(DescriptorSlot {
                index,
                kind: self.kind,
            }),
            Err(err) => Err(self.map_error(err)),
        }
    }

    pub fn free(&mut self, slot: DescriptorSlot) -> Result<(), BindlessError> {
        if slot.kind != self.kind {
            return Err(BindlessError::InvalidArgument(format!(
                "{} slot {} returned to {} heap",
                slot.kind, slot.index, self.kind
            )));
        }
        self.allocator
            .free(slot.index)
            .map_err(|err| self.map_error(err))
    }

    pub fn cpu_address(&self, index: u32) -> Result<u64, BindlessError> {
        self.check_range(index)?;
        Ok(self.layout.cpu_base + u64::from(index) * self.layout.stride)
    }

    pub fn gpu_address(&self, index: u32) -> Result<u64, BindlessError> {
        self.check_range(index)?;
        Ok(self.layout.gpu_base + u64::from(index) * self.layout.stride)
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.allocator.capacity()
    }

    pub fn available(&self) -> u32 {
        self.allocator.available()
    }

    pub fn in_use(&self) -> u32 {
        self.allocator.in_use()
    }

    pub fn is_allocated(&self, index: u32) -> bool {
        self.allocator.is_allocated(index)
    }

    fn check_range(&self, index: u32) -> Result<(), BindlessError> {
        if index >= self.capacity() {
            return Err(BindlessError::InvalidArgument(format!(
                "{} slot {index} is outside capacity {}",
                self.kind,
                self.capacity()
            )));
        }
        Ok(())
    }

    fn map_error(&self, err: SlotError) -> BindlessError {
        match err {
            SlotError::Exhausted => BindlessError::ResourceExhausted {
                kind: self.kind,
                capacity: self.capacity(),
            },
            other => BindlessError::InvalidArgument(format!("{} heap: {other}", self.kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn allocates_every_index_once_then_exhausts() {
        let mut allocator = DescriptorSlotAllocator::new(70);
        let indices: Vec<u32> = (0..70).map(|_| allocator.allocate().unwrap()).collect();
        let distinct: HashSet<u32> = indices.iter().copied().collect();
        assert_eq!(distinct.len(), 70);
        assert!(indices.iter().all(|&index| index < 70));
        assert_eq!(allocator.allocate(), Err(SlotError::Exhausted));
        assert_eq!(allocator.in_use(), 70);
        assert_eq!(allocator.available(), 0);
    }

    #[test]
    fn freed_index_is_reused_fifo() {
        let mut allocator = DescriptorSlotAllocator::new(3);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        let c = allocator.allocate().unwrap();
        allocator.free(b).unwrap();
        allocator.free(a).unwrap();
        assert_eq!(allocator.allocate().unwrap(), b);
        assert_eq!(allocator.allocate().unwrap(), a);
        assert!(allocator.is_allocated(c));
    }

    #[test]
    fn recently_freed_index_goes_to_the_back() {
        let mut allocator = DescriptorSlotAllocator::new(4);
        let first = allocator.allocate().unwrap();
        allocator.free(first).unwrap();
        let next: Vec<u32> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(next, vec![1, 2, 3, first]);
    }

    #[test]
    fn rejects_out_of_range_and_double_free() {
        let mut allocator = DescriptorSlotAllocator::new(2);
        assert_eq!(
            allocator.free(2),
            Err(SlotError::OutOfRange {
                index: 2,
                capacity: 2
            })
        );
        assert_eq!(allocator.free(1), Err(SlotError::DoubleFree(1)));

        let index = allocator.allocate().unwrap();
        allocator.free(index).unwrap();
        assert_eq!(allocator.free(index), Err(SlotError::DoubleFree(index)));
        assert_eq!(allocator.available(), 2);
    }

    #[test]
    fn zero_capacity_pool_is_always_exhausted() {
        let mut allocator = DescriptorSlotAllocator::new(0);
        assert_eq!(allocator.allocate(), Err(SlotError::Exhausted));
    }

    #[test]
    fn heap_maps_exhaustion_to_typed_error() {
        let mut heap = DescriptorHeap::new(ViewKind::RenderTarget, 1, HeapLayout::INDEXED);
        heap.allocate().unwrap();
        assert_eq!(
            heap.allocate(),
            Err(BindlessError::ResourceExhausted {
                kind: ViewKind::RenderTarget,
                capacity: 1
            })
        );
    }

    #[test]
    fn heap_addresses_are_linear_in_the_index() {
        let layout = HeapLayout {
            cpu_base: 0x1000,
            gpu_base: 0,
            stride: 256,
        };
        let heap = DescriptorHeap::new(ViewKind::ConstantBuffer, 8, layout);
        assert_eq!(heap.cpu_address(3).unwrap(), 0x1000 + 3 * 256);
        assert_eq!(heap.gpu_address(7).unwrap(), 7 * 256);
        assert!(matches!(
            heap.gpu_address(8),
            Err(BindlessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn heap_rejects_slots_from_other_heaps() {
        let mut sampled = DescriptorHeap::new(ViewKind::SampledImage, 2, HeapLayout::INDEXED);
        let mut targets = DescriptorHeap::new(ViewKind::RenderTarget, 2, HeapLayout::INDEXED);
        let slot = targets.allocate().unwrap();
        assert!(matches!(
            sampled.free(slot),
            Err(BindlessError::InvalidArgument(_))
        ));
        targets.free(slot).unwrap();
        assert!(matches!(
            targets.free(slot),
            Err(BindlessError::InvalidArgument(_))
        ));
    }
}
