//! Whole-manager checks: random access sequences and concurrent faulting
//! must keep the frame table, page tables and swap bitmap in agreement.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::address::{VirtAddr, PAGE_SIZE};
use super::paging::PageDirectory;
use super::spt::PageStatus;
use crate::process::AddressSpace;
use crate::testutil::{fixture, Fixture, MemFile, Mmu, SoftPageDirectory};

const ZERO_BASE: usize = 0x0010_0000;
const MMAP_BASE: usize = 0x2000_0000;
const ZERO_PAGES: usize = 4;
const MMAP_PAGES: usize = 2;

fn page_addr(page: usize) -> VirtAddr {
    if page < ZERO_PAGES {
        VirtAddr::new(ZERO_BASE).add_pages(page)
    } else {
        VirtAddr::new(MMAP_BASE).add_pages(page - ZERO_PAGES)
    }
}

/// Every resident descriptor owns exactly the frame table entry for its
/// frame, every frame table entry belongs to a resident descriptor, and
/// every used swap slot belongs to a swapped descriptor.
fn check_consistency(
    fx: &Fixture,
    spaces: &[(Arc<AddressSpace>, Arc<SoftPageDirectory>)],
) -> Result<(), TestCaseError> {
    let snapshot = fx.vm.frames.snapshot();
    let mut resident = 0;
    let mut swapped = 0;

    for (space, dir) in spaces {
        let spt = space.spt.lock();
        for desc in spt.iter() {
            prop_assert!(!desc.is_busy());
            match desc.status {
                PageStatus::Resident { frame, .. } => {
                    resident += 1;
                    let owners: Vec<_> = snapshot.iter().filter(|e| e.0 == frame).collect();
                    prop_assert_eq!(owners.len(), 1);
                    prop_assert_eq!(owners[0].1, space.pid());
                    prop_assert_eq!(owners[0].2, desc.upage);
                    prop_assert!(!owners[0].3, "resident frame left pinned");
                    prop_assert_eq!(dir.translate(desc.upage), Some(frame));
                }
                PageStatus::Swapped(slot) => {
                    swapped += 1;
                    prop_assert!(fx.vm.swap.is_used(slot));
                    prop_assert_eq!(dir.translate(desc.upage), None);
                }
                _ => {
                    prop_assert_eq!(dir.translate(desc.upage), None);
                }
            }
        }
    }

    prop_assert_eq!(snapshot.len(), resident);
    prop_assert_eq!(fx.vm.swap_slots_in_use(), swapped);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Read { proc: usize, page: usize },
    Write { proc: usize, page: usize, value: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    let pages = ZERO_PAGES + MMAP_PAGES;
    prop_oneof![
        (0..2usize, 0..pages).prop_map(|(proc, page)| Op::Read { proc, page }),
        (0..2usize, 0..pages, any::<u8>()).prop_map(|(proc, page, value)| Op::Write {
            proc,
            page,
            value
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tables_agree_under_pressure(ops in proptest::collection::vec(op(), 1..80)) {
        let fx = fixture(3, 16);
        let mut spaces = Vec::new();
        let mut files = Vec::new();
        let mut model = BTreeMap::new();

        for proc in 0..2usize {
            let (space, dir) = fx.space(proc as u32 + 1);
            for page in 0..ZERO_PAGES {
                space.spt.lock().insert_zero(page_addr(page), true).unwrap();
                model.insert((proc, page), 0u8);
            }
            let fill = 0x10 + proc as u8;
            let file = MemFile::new(vec![fill; MMAP_PAGES * PAGE_SIZE]);
            fx.vm.mmap(&space, &file.handle(), VirtAddr::new(MMAP_BASE)).unwrap();
            for page in ZERO_PAGES..ZERO_PAGES + MMAP_PAGES {
                model.insert((proc, page), fill);
            }
            files.push(file);
            spaces.push((space, dir));
        }

        for op in ops {
            match op {
                Op::Read { proc, page } => {
                    let (space, dir) = &spaces[proc];
                    let value = Mmu::new(&fx.vm, space, dir).read(page_addr(page)).unwrap();
                    prop_assert_eq!(value, model[&(proc, page)]);
                }
                Op::Write { proc, page, value } => {
                    let (space, dir) = &spaces[proc];
                    Mmu::new(&fx.vm, space, dir).write(page_addr(page), value).unwrap();
                    model.insert((proc, page), value);
                }
            }
            check_consistency(&fx, &spaces)?;
        }

        for (space, _dir) in &spaces {
            fx.vm.destroy_address_space(space);
        }
        prop_assert_eq!(fx.vm.free_frames(), 3);
        prop_assert_eq!(fx.vm.swap_slots_in_use(), 0);

        // the last value written to each mapped page reached its file
        for (proc, file) in files.iter().enumerate() {
            let contents = file.contents();
            for page in ZERO_PAGES..ZERO_PAGES + MMAP_PAGES {
                let offset = (page - ZERO_PAGES) * PAGE_SIZE;
                prop_assert_eq!(contents[offset], model[&(proc, page)]);
            }
        }
    }
}

#[test]
fn test_concurrent_faults_keep_content() {
    const THREADS: usize = 4;
    const PAGES: usize = 5;
    const ROUNDS: usize = 300;

    let fx = fixture(8, 32);
    // two processes with two threads each; threads own disjoint pages
    let spaces: Vec<_> = (0..2).map(|pid| fx.space(pid + 1)).collect();
    for (space, _) in &spaces {
        for page in 0..2 * PAGES {
            space
                .spt
                .lock()
                .insert_zero(VirtAddr::new(ZERO_BASE).add_pages(page), true)
                .unwrap();
        }
    }

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let (space, dir) = &spaces[t % 2];
            let fx = &fx;
            s.spawn(move || {
                let mmu = Mmu::new(&fx.vm, space, dir);
                let first = (t / 2) * PAGES;
                let mut expected = [0u8; PAGES];
                for round in 0..ROUNDS {
                    let i = (round * 3 + t) % PAGES;
                    let addr = VirtAddr::new(ZERO_BASE).add_pages(first + i);
                    let value = (round as u8).wrapping_mul(31) ^ t as u8;
                    mmu.write(addr, value).unwrap();
                    expected[i] = value;

                    let j = (round * 7) % PAGES;
                    let addr = VirtAddr::new(ZERO_BASE).add_pages(first + j);
                    assert_eq!(mmu.read(addr).unwrap(), expected[j]);
                }
            });
        }
    });

    check_consistency(&fx, &spaces).unwrap();
    assert_eq!(fx.vm.resident_frames(), 8);

    for (space, _) in &spaces {
        fx.vm.destroy_address_space(space);
    }
    assert_eq!(fx.vm.free_frames(), 8);
    assert_eq!(fx.vm.swap_slots_in_use(), 0);
}
