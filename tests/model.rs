// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Model-based property testing: a random sequence of allocator operations
//! is replayed against a live `Arena`, checking that the invariants a
//! caller actually depends on (non-overlapping live allocations,
//! page-quantized sizes, content surviving a resize) hold for every
//! sequence bolero generates.

use bolero::check;
use bolero_generator::TypeGenerator;
use page_alloc::Arena;

const PAGE_SIZE: u32 = 64;
const PAGES: u32 = 16;

#[derive(Debug, Clone, TypeGenerator)]
enum Op {
    Alloc { size: u16 },
    Free { slot: u8 },
    Resize { slot: u8, new_size: u16 },
}

struct Live {
    ptr: *mut u8,
    requested: usize,
    tag: u8,
}

#[test]
fn operation_sequences_never_corrupt_or_overlap_live_allocations() {
    check!()
        .with_type::<Vec<Op>>()
        .for_each(|ops| {
            let mut arena = Arena::init(PAGE_SIZE, PAGES, None).unwrap();
            let mut live: Vec<Live> = Vec::new();
            let mut next_tag = 0u8;

            for op in ops {
                match op {
                    Op::Alloc { size } => {
                        let size = (*size as usize % (PAGE_SIZE as usize * PAGES as usize)) + 1;
                        if let Ok(ptr) = arena.alloc(size, 0, 0, false) {
                            let tag = next_tag;
                            next_tag = next_tag.wrapping_add(1);
                            unsafe { ptr.as_ptr().write_bytes(tag, size) };
                            live.push(Live {
                                ptr: ptr.as_ptr(),
                                requested: size,
                                tag,
                            });
                        }
                    }
                    Op::Free { slot } => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = *slot as usize % live.len();
                        let entry = live.remove(index);
                        let ptr = core::ptr::NonNull::new(entry.ptr).unwrap();
                        arena.free(ptr, Some(entry.requested)).unwrap();
                    }
                    Op::Resize { slot, new_size } => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = *slot as usize % live.len();
                        let new_size =
                            (*new_size as usize % (PAGE_SIZE as usize * PAGES as usize)) + 1;
                        let entry = &live[index];
                        let ptr = core::ptr::NonNull::new(entry.ptr).unwrap();
                        if let Ok(resized) =
                            arena.resize(ptr, Some(entry.requested), new_size, 0, 0, true, false)
                        {
                            let kept = entry.requested.min(new_size);
                            let bytes =
                                unsafe { core::slice::from_raw_parts(resized.as_ptr(), kept) };
                            assert!(bytes.iter().all(|&b| b == entry.tag));
                            live[index].ptr = resized.as_ptr();
                            live[index].requested = new_size;
                        }
                    }
                }
            }

            // Every surviving allocation's content must still match its tag
            // and no two surviving allocations may overlap.
            for entry in &live {
                let size = arena.size_of(core::ptr::NonNull::new(entry.ptr).unwrap()).unwrap();
                assert!(size >= entry.requested);
                let bytes = unsafe { core::slice::from_raw_parts(entry.ptr, entry.requested) };
                assert!(bytes.iter().all(|&b| b == entry.tag));
            }
            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    let a_size = arena.size_of(core::ptr::NonNull::new(a.ptr).unwrap()).unwrap();
                    let a_range = a.ptr as usize..a.ptr as usize + a_size;
                    assert!(!a_range.contains(&(b.ptr as usize)));
                }
            }
        });
}
