//! Test doubles for the host kernel: a software page directory, in-memory
//! files and disk, a process context, and an MMU that faults on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::drivers::block::{BlockDevice, BlockError, SectorId, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::error::VmResult;
use crate::fs::{File, FileHandle};
use crate::mm::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mm::frame::UserPool;
use crate::mm::paging::{MappingError, PageDirectory, PageTableEntry, PteFlags};
use crate::mm::{PageFault, VmConfig, VmManager};
use crate::process::{AddressSpace, Pid, ProcessContext, Tid};
use crate::sync::FsLock;

/// Physical address of the first test frame.
const POOL_PHYS_BASE: usize = 0x0010_0000;

/// Stalls a test double's transfers until the test lets them through.
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: AtomicBool,
    open: AtomicBool,
}

impl Gate {
    /// Make every following transfer wait for `open`.
    pub fn arm(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.entered.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Block until some transfer is stalled at the gate.
    pub fn wait_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }

    /// Let stalled and later transfers through.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn pass(&self) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        self.entered.store(true, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }
}

/// Page directory kept in a map of raw entries.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<VirtAddr, PageTableEntry>>,
}

impl SoftPageDirectory {
    pub fn entry(&self, upage: VirtAddr) -> Option<PageTableEntry> {
        self.entries
            .lock()
            .get(&upage)
            .copied()
            .filter(|pte| pte.is_present())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// What the MMU does on every access.
    fn mark_used(&self, upage: VirtAddr, write: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.set_flags(PteFlags::ACCESSED, true);
            if write {
                pte.set_flags(PteFlags::DIRTY, true);
            }
        }
    }

    fn flag(&self, upage: VirtAddr, flag: PteFlags) -> bool {
        self.entry(upage)
            .is_some_and(|pte| pte.flags().contains(flag))
    }

    fn set_flag(&self, upage: VirtAddr, flag: PteFlags, value: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage) {
            pte.set_flags(flag, value);
        }
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&self, upage: VirtAddr, frame: PhysAddr, writable: bool) -> Result<(), MappingError> {
        if !upage.is_aligned() || !frame.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        if !upage.is_user() {
            return Err(MappingError::KernelAddress);
        }
        let mut entries = self.entries.lock();
        if entries.get(&upage).is_some_and(|pte| pte.is_present()) {
            return Err(MappingError::AlreadyMapped);
        }
        entries.insert(upage, PageTableEntry::user_page(frame, writable));
        Ok(())
    }

    fn unmap(&self, upage: VirtAddr) -> Option<PageTableEntry> {
        self.entries
            .lock()
            .remove(&upage)
            .filter(|pte| pte.is_present())
    }

    fn translate(&self, upage: VirtAddr) -> Option<PhysAddr> {
        self.entry(upage).map(PageTableEntry::frame)
    }

    fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.flag(upage, PteFlags::DIRTY)
    }

    fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        self.set_flag(upage, PteFlags::DIRTY, dirty);
    }

    fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.flag(upage, PteFlags::ACCESSED)
    }

    fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        self.set_flag(upage, PteFlags::ACCESSED, accessed);
    }
}

/// A directory whose dirty-bit query lags behind the MMU, as a sibling
/// thread's write can on real hardware. Only the entry `unmap` removes is
/// authoritative.
pub struct StaleDirtyDirectory(pub Arc<SoftPageDirectory>);

impl PageDirectory for StaleDirtyDirectory {
    fn map(&self, upage: VirtAddr, frame: PhysAddr, writable: bool) -> Result<(), MappingError> {
        self.0.map(upage, frame, writable)
    }

    fn unmap(&self, upage: VirtAddr) -> Option<PageTableEntry> {
        self.0.unmap(upage)
    }

    fn translate(&self, upage: VirtAddr) -> Option<PhysAddr> {
        self.0.translate(upage)
    }

    fn is_dirty(&self, _upage: VirtAddr) -> bool {
        false
    }

    fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        self.0.set_dirty(upage, dirty);
    }

    fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.0.is_accessed(upage)
    }

    fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        self.0.set_accessed(upage, accessed);
    }
}

struct MemFileInner {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    opens: AtomicUsize,
    denied: AtomicUsize,
    read_gate: Gate,
    write_gate: Gate,
}

/// A fixed-length file in memory. Reopened handles share data and counters.
pub struct MemFile {
    inner: Arc<MemFileInner>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MemFileInner {
                data: Mutex::new(data),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                opens: AtomicUsize::new(1),
                denied: AtomicUsize::new(0),
                read_gate: Gate::default(),
                write_gate: Gate::default(),
            }),
        })
    }

    pub fn handle(self: &Arc<Self>) -> FileHandle {
        Arc::clone(self) as FileHandle
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn read_gate(&self) -> &Gate {
        &self.inner.read_gate
    }

    pub fn write_gate(&self) -> &Gate {
        &self.inner.write_gate
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.inner.read_gate.pass();
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.inner.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.inner.write_gate.pass();
        if self.inner.denied.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.inner.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.inner.data.lock().len() as u64
    }

    fn reopen(&self) -> Option<FileHandle> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(MemFile {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn deny_write(&self) {
        self.inner.denied.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(&self) {
        self.inner.denied.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A swap disk in memory that counts sector transfers.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    write_gate: Gate,
}

impl RamDisk {
    pub fn with_slots(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; slots * SECTORS_PER_PAGE * SECTOR_SIZE]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            write_gate: Gate::default(),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_gate(&self) -> &Gate {
        &self.write_gate
    }

    fn range(&self, sector: SectorId, len: usize) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * SECTOR_SIZE;
        if len != SECTOR_SIZE || start + SECTOR_SIZE > self.data.lock().len() {
            return Err(BlockError::OutOfRange);
        }
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> SectorId {
        (self.data.lock().len() / SECTOR_SIZE) as SectorId
    }

    fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector, buf.len())?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write(&self, sector: SectorId, buf: &[u8]) -> Result<(), BlockError> {
        self.write_gate.pass();
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::Io);
        }
        let range = self.range(sector, buf.len())?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

std::thread_local! {
    static TID: Tid = Tid::new(NEXT_TID.fetch_add(1, Ordering::Relaxed));
}

/// Process context that records terminations instead of killing anything.
#[derive(Default)]
pub struct TestContext {
    terminated: Mutex<Vec<(Pid, i32)>>,
}

impl TestContext {
    pub fn terminations(&self) -> Vec<(Pid, i32)> {
        self.terminated.lock().clone()
    }
}

impl ProcessContext for TestContext {
    fn current_tid(&self) -> Tid {
        TID.with(|tid| *tid)
    }

    fn terminate(&self, pid: Pid, status: i32) {
        self.terminated.lock().push((pid, status));
    }
}

/// A manager over a leaked frame pool and a RAM swap disk.
pub struct Fixture {
    pub vm: VmManager,
    pub disk: Arc<RamDisk>,
    pub context: Arc<TestContext>,
    pub fs_lock: Arc<FsLock>,
}

impl Fixture {
    pub fn space(&self, pid: u32) -> (Arc<AddressSpace>, Arc<SoftPageDirectory>) {
        let dir = Arc::new(SoftPageDirectory::default());
        let space = self.vm.create_address_space(Pid::new(pid), dir.clone());
        (space, dir)
    }

    /// A process whose manager sees only a [`StaleDirtyDirectory`]; the
    /// returned directory is the one the MMU updates.
    pub fn space_with_stale_dirty_bits(
        &self,
        pid: u32,
    ) -> (Arc<AddressSpace>, Arc<SoftPageDirectory>) {
        let dir = Arc::new(SoftPageDirectory::default());
        let stale = Arc::new(StaleDirtyDirectory(dir.clone()));
        let space = self.vm.create_address_space(Pid::new(pid), stale);
        (space, dir)
    }
}

pub fn fixture(frames: usize, swap_slots: usize) -> Fixture {
    let memory: &'static mut [u8] = Box::leak(vec![0u8; frames * PAGE_SIZE].into_boxed_slice());
    let pool = UserPool::from_static(memory, PhysAddr::new(POOL_PHYS_BASE));
    let disk = RamDisk::with_slots(swap_slots);
    let context = Arc::new(TestContext::default());
    let fs_lock = Arc::new(FsLock::new());
    let vm = VmManager::new(
        pool,
        disk.clone(),
        fs_lock.clone(),
        context.clone(),
        VmConfig::default(),
    );
    Fixture {
        vm,
        disk,
        context,
        fs_lock,
    }
}

/// User-mode memory access through a process's page directory, faulting
/// pages in as the hardware would.
pub struct Mmu<'a> {
    vm: &'a VmManager,
    space: &'a Arc<AddressSpace>,
    dir: &'a SoftPageDirectory,
    esp: VirtAddr,
}

impl<'a> Mmu<'a> {
    pub fn new(
        vm: &'a VmManager,
        space: &'a Arc<AddressSpace>,
        dir: &'a Arc<SoftPageDirectory>,
    ) -> Self {
        Self {
            vm,
            space,
            dir,
            esp: VirtAddr::new(crate::mm::address::PHYS_BASE),
        }
    }

    pub fn with_esp(self, esp: VirtAddr) -> Self {
        Self { esp, ..self }
    }

    pub fn read(&self, addr: VirtAddr) -> VmResult<u8> {
        self.access(addr, None)
    }

    pub fn write(&self, addr: VirtAddr, value: u8) -> VmResult<()> {
        self.access(addr, Some(value)).map(|_| ())
    }

    fn access(&self, addr: VirtAddr, value: Option<u8>) -> VmResult<u8> {
        let write = value.is_some();
        loop {
            let not_present = {
                // Mapped frames are only touched under their page table lock.
                let _spt = self.space.spt.lock();
                match self.dir.entry(addr.page()) {
                    Some(pte) if write && !pte.flags().contains(PteFlags::WRITABLE) => false,
                    Some(pte) => {
                        self.dir.mark_used(addr.page(), write);
                        // SAFETY: see above.
                        let page = unsafe { self.vm.frames.page_mut(pte.frame()) };
                        let byte = &mut page[addr.page_offset()];
                        if let Some(value) = value {
                            *byte = value;
                        }
                        return Ok(*byte);
                    }
                    None => true,
                }
            };
            self.vm.resolve_fault(
                self.space,
                PageFault {
                    addr,
                    esp: self.esp,
                    write,
                    not_present,
                },
            )?;
        }
    }
}
