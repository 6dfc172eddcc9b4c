use std::ops::Range;

use bevy::ecs::entity::Entity;
use smallvec::SmallVec;

use crate::{BlasHandle, Mobility, RayTracingError};

/// A contiguous range of instance slots owned by one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub offset: u32,
    pub count: u32,
}

impl Allocation {
    pub fn end(&self) -> u32 {
        self.offset + self.count
    }
    pub fn slots(&self) -> Range<u32> {
        self.offset..self.end()
    }
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u32,
    length: u32,
}

impl FreeRange {
    fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// Best fit range allocator over the fixed slot address space `[0, capacity)`.
///
/// The free list is kept sorted by offset and fully coalesced, so its last entry is the
/// unused tail of the address space whenever that tail is non-empty.
pub struct InstanceAllocator {
    capacity: u32,
    free_list: SmallVec<[FreeRange; 16]>,
    live: u32,
}

impl InstanceAllocator {
    pub fn new(capacity: u32) -> Self {
        let mut free_list = SmallVec::new();
        if capacity > 0 {
            free_list.push(FreeRange {
                offset: 0,
                length: capacity,
            });
        }
        Self {
            capacity,
            free_list,
            live: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots currently owned by live allocations.
    pub fn live_slots(&self) -> u32 {
        self.live
    }

    /// One past the highest slot owned by any live allocation.
    pub fn high_water(&self) -> u32 {
        match self.free_list.last() {
            Some(tail) if tail.end() == self.capacity => tail.offset,
            _ => self.capacity,
        }
    }

    pub fn allocate(&mut self, count: u32) -> Result<Allocation, RayTracingError> {
        if count == 0 {
            return Ok(Allocation {
                offset: 0,
                count: 0,
            });
        }
        let mut best: Option<usize> = None;
        for (index, range) in self.free_list.iter().enumerate() {
            if range.length < count {
                continue;
            }
            if range.length == count {
                best = Some(index);
                break;
            }
            match best {
                Some(best_index) if self.free_list[best_index].length <= range.length => {}
                _ => best = Some(index),
            }
        }
        let Some(index) = best else {
            return Err(RayTracingError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        };
        let range = &mut self.free_list[index];
        let offset = range.offset;
        if range.length == count {
            self.free_list.remove(index);
        } else {
            range.offset += count;
            range.length -= count;
        }
        self.live += count;
        Ok(Allocation { offset, count })
    }

    pub fn free(&mut self, allocation: Allocation) {
        if allocation.is_empty() {
            return;
        }
        assert!(
            allocation.end() <= self.capacity,
            "freeing {allocation:?} outside of the slot space"
        );
        let index = self
            .free_list
            .partition_point(|range| range.offset < allocation.offset);
        if let Some(prev) = index.checked_sub(1).map(|i| self.free_list[i]) {
            assert!(prev.end() <= allocation.offset, "double free of {allocation:?}");
        }
        if let Some(next) = self.free_list.get(index) {
            assert!(allocation.end() <= next.offset, "double free of {allocation:?}");
        }

        let mut freed = FreeRange {
            offset: allocation.offset,
            length: allocation.count,
        };
        let merges_next = self
            .free_list
            .get(index)
            .is_some_and(|next| next.offset == freed.end());
        if merges_next {
            freed.length += self.free_list.remove(index).length;
        }
        match index.checked_sub(1) {
            Some(prev) if self.free_list[prev].end() == freed.offset => {
                self.free_list[prev].length += freed.length;
            }
            _ => self.free_list.insert(index, freed),
        }
        self.live -= allocation.count;
    }
}

/// Bookkeeping for one row of the instance arrays. The row index is the slot index.
#[derive(Debug, Clone, Default)]
pub struct InstanceSlot {
    pub owner: Option<Entity>,
    /// Lookup key into the BLAS registry. `None` once the slot was released.
    pub blas: Option<BlasHandle>,
    pub mobility: Mobility,
    pub mask: u8,
    pub shader_offset: u32,
}

impl InstanceSlot {
    pub fn is_live(&self) -> bool {
        self.owner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_contiguous() {
        let mut allocator = InstanceAllocator::new(16);
        let a = allocator.allocate(2).unwrap();
        let b = allocator.allocate(3).unwrap();
        assert_eq!(a, Allocation { offset: 0, count: 2 });
        assert_eq!(b, Allocation { offset: 2, count: 3 });
        assert_eq!(allocator.high_water(), 5);
        assert_eq!(allocator.live_slots(), 5);
    }

    #[test]
    fn test_best_fit_reuses_smallest_hole() {
        let mut allocator = InstanceAllocator::new(32);
        let a = allocator.allocate(4).unwrap();
        let _b = allocator.allocate(1).unwrap();
        let c = allocator.allocate(2).unwrap();
        let _d = allocator.allocate(1).unwrap();
        allocator.free(a);
        allocator.free(c);
        // Holes of 4 and 2 slots; a request for 2 must take the exact fit.
        assert_eq!(allocator.allocate(2).unwrap(), c);
        assert_eq!(allocator.allocate(3).unwrap().offset, 0);
    }

    #[test]
    fn test_free_coalesces_and_lowers_high_water() {
        let mut allocator = InstanceAllocator::new(8);
        let a = allocator.allocate(2).unwrap();
        let b = allocator.allocate(2).unwrap();
        let c = allocator.allocate(2).unwrap();
        allocator.free(c);
        assert_eq!(allocator.high_water(), 4);
        allocator.free(a);
        assert_eq!(allocator.high_water(), 4);
        allocator.free(b);
        assert_eq!(allocator.high_water(), 0);
        assert_eq!(allocator.live_slots(), 0);
        assert_eq!(allocator.allocate(8).unwrap(), Allocation { offset: 0, count: 8 });
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut allocator = InstanceAllocator::new(4);
        allocator.allocate(3).unwrap();
        assert_eq!(
            allocator.allocate(2),
            Err(RayTracingError::CapacityExceeded {
                requested: 2,
                capacity: 4
            })
        );
        assert_eq!(allocator.high_water(), 3);
        assert_eq!(allocator.allocate(1).unwrap().offset, 3);
        assert_eq!(allocator.high_water(), 4);
    }

    #[test]
    fn test_empty_allocation() {
        let mut allocator = InstanceAllocator::new(4);
        let empty = allocator.allocate(0).unwrap();
        assert!(empty.is_empty());
        allocator.free(empty);
        assert_eq!(allocator.live_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut allocator = InstanceAllocator::new(8);
        let a = allocator.allocate(2).unwrap();
        allocator.allocate(2).unwrap();
        allocator.free(a);
        allocator.free(a);
    }

    #[test]
    fn test_live_allocations_never_overlap() {
        // Deterministic pseudo random sequence of allocations and frees.
        let mut allocator = InstanceAllocator::new(256);
        let mut live: Vec<Allocation> = Vec::new();
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !live.is_empty() {
                let index = (seed as usize / 3) % live.len();
                allocator.free(live.swap_remove(index));
            } else if let Ok(allocation) = allocator.allocate(seed % 7 + 1) {
                live.push(allocation);
            }
            for (i, a) in live.iter().enumerate() {
                assert!(a.end() <= allocator.high_water());
                for b in &live[i + 1..] {
                    assert!(a.end() <= b.offset || b.end() <= a.offset, "{a:?} overlaps {b:?}");
                }
            }
            assert_eq!(
                allocator.live_slots(),
                live.iter().map(|a| a.count).sum::<u32>()
            );
        }
    }
}
