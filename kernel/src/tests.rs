//! Cross-module scenarios, each run against every page-table format.

use khal::arch::{Aarch64, I686, X86_64};
use khal::caps::Capability;
use khal::mmu::SoftMmu;
use khal::{FaultCode, HalError, HalResult, PageFlags, Platform, VirtAddr};

use crate::config::{CowOomPolicy, KernelConfig};
use crate::memory::{FaultOutcome, MapError, Vmm, handle_page_fault};
use crate::syscall::{SyscallTable, errno};
use crate::task::TaskTable;
use crate::testing::{SimRam, USER_PAGE, user_rw, with_vmm};

/// Raw syndrome of a user-mode write to a present read-only page.
const X86_USER_WRITE: u64 = 0x7;
/// ESR_EL1: EC=0x24 (data abort from EL0), WnR, DFSC=0x0F (permission, L3).
const ARM_USER_WRITE: u64 = (0x24 << 26) | (1 << 6) | 0x0F;

const CODE_PAGE: VirtAddr = VirtAddr::new(0x0040_1000);

fn fork_then_write<P: Platform>(user_write: u64) {
    with_vmm::<P>(256, |ram, vmm| {
        let pmm = vmm.pmm();
        let parent_dir = vmm.create_page_directory().unwrap();
        let data = pmm.alloc_frame().unwrap();
        let code = pmm.alloc_frame().unwrap();
        ram.bytes_mut(data)[..5].copy_from_slice(b"hello");
        vmm.map_page_in_directory(parent_dir, USER_PAGE, data, user_rw::<P>()).unwrap();
        vmm.map_page_in_directory(parent_dir, CODE_PAGE, code, PageFlags::USER_CODE).unwrap();

        let mut tasks = TaskTable::<P, 4>::new();
        let parent = tasks.spawn_user(CODE_PAGE.as_u64() as usize, 0x1000_0000, 0, parent_dir).unwrap();
        let child = tasks.fork(parent, 0, vmm).unwrap();
        let child_dir = tasks.get(child).unwrap().directory;

        assert_eq!(pmm.refcount(data), 2, "{}", P::NAME);
        assert_eq!(pmm.refcount(code), 2);
        for dir in [parent_dir, child_dir] {
            let d = vmm.query(dir, USER_PAGE).unwrap();
            assert!(d.flags.contains(PageFlags::COW) && !d.flags.contains(PageFlags::WRITABLE));
            let c = vmm.query(dir, CODE_PAGE).unwrap();
            assert!(!c.flags.contains(PageFlags::COW), "read-only pages are shared as-is");
        }

        // Child writes first: shared, so it gets a private copy.
        unsafe { vmm.switch_page_directory(child_dir) }.unwrap();
        let cfg = KernelConfig::DEFAULT;
        assert_eq!(handle_page_fault(vmm, USER_PAGE + 3, user_write, &cfg), FaultOutcome::Resolved);
        let copy = vmm.translate(child_dir, USER_PAGE).unwrap();
        assert_ne!(copy, data);
        assert_eq!(&ram.bytes(copy)[..5], b"hello");
        ram.bytes_mut(copy)[0] = b'j';
        assert_eq!(ram.bytes(data)[0], b'h', "parent still sees its own data");
        assert_eq!(pmm.refcount(data), 1);

        // Parent is now the sole owner: write access restored in place.
        unsafe { vmm.switch_page_directory(parent_dir) }.unwrap();
        assert_eq!(handle_page_fault(vmm, USER_PAGE, user_write, &cfg), FaultOutcome::Resolved);
        assert_eq!(vmm.translate(parent_dir, USER_PAGE), Some(data));
        assert!(vmm.query(parent_dir, USER_PAGE).unwrap().flags.contains(PageFlags::WRITABLE));

        // Writing to real read-only text kills the task.
        assert_eq!(handle_page_fault(vmm, CODE_PAGE, user_write, &cfg), FaultOutcome::KillTask);

        unsafe { vmm.switch_page_directory(vmm.kernel_directory()) }.unwrap();
        tasks.exit(child, vmm).unwrap();
        tasks.exit(parent, vmm).unwrap();
        assert!(!pmm.is_allocated(data) && !pmm.is_allocated(code) && !pmm.is_allocated(copy));
    });
}

#[test]
fn fork_then_write_all_arches() {
    fork_then_write::<I686>(X86_USER_WRITE);
    fork_then_write::<X86_64>(X86_USER_WRITE);
    fork_then_write::<Aarch64>(ARM_USER_WRITE);
}

fn refcounts_follow_address_spaces<P: Platform>() {
    with_vmm::<P>(256, |_, vmm| {
        let pmm = vmm.pmm();
        let baseline = pmm.free_frame_count();
        let a = vmm.create_page_directory().unwrap();
        let frame = pmm.alloc_frame().unwrap();
        vmm.map_page_in_directory(a, USER_PAGE, frame, user_rw::<P>()).unwrap();

        let b = vmm.clone_page_directory(a).unwrap();
        let c = vmm.clone_page_directory(b).unwrap();
        assert_eq!(pmm.refcount(frame), 3, "{}", P::NAME);
        assert!(vmm.free_page_directory(c));
        assert!(vmm.free_page_directory(b));
        assert_eq!(pmm.refcount(frame), 1);
        assert!(vmm.free_page_directory(a));
        assert_eq!(pmm.refcount(frame), 0);
        assert!(!pmm.is_allocated(frame));
        assert_eq!(pmm.free_frame_count(), baseline, "tables and directories returned too");
    });
}

#[test]
fn refcounts_follow_address_spaces_all_arches() {
    refcounts_follow_address_spaces::<I686>();
    refcounts_follow_address_spaces::<X86_64>();
    refcounts_follow_address_spaces::<Aarch64>();
}

fn new_directories_are_isolated<P: Platform>() {
    with_vmm::<P>(256, |_, vmm| {
        let pmm = vmm.pmm();
        let master = vmm.kernel_directory();
        let kpage = VirtAddr::new(P::KERNEL_VIRTUAL_BASE);
        assert!(vmm.map_page(kpage, pmm.alloc_frame().unwrap(), PageFlags::WRITABLE));
        let busy = vmm.create_page_directory().unwrap();
        vmm.map_page_in_directory(busy, USER_PAGE, pmm.alloc_frame().unwrap(), user_rw::<P>()).unwrap();

        let fresh = vmm.create_page_directory().unwrap();
        for i in P::kernel_root_range() {
            assert_eq!(vmm.root_entry(fresh, i), vmm.root_entry(master, i), "{} slot {}", P::NAME, i);
        }
        assert!(P::user_root_range().all(|i| vmm.root_entry(fresh, i) == 0));
        assert_eq!(vmm.translate(fresh, USER_PAGE), None);
        assert!(vmm.translate(fresh, kpage).is_some());
    });
}

#[test]
fn new_directories_are_isolated_all_arches() {
    new_directories_are_isolated::<I686>();
    new_directories_are_isolated::<X86_64>();
    new_directories_are_isolated::<Aarch64>();
}

fn vmm_agrees_with_capabilities<P: Platform>() {
    let caps = P::capabilities();
    with_vmm::<P>(128, |_, vmm| {
        let dir = vmm.create_page_directory().unwrap();
        let f = vmm.pmm().alloc_frame().unwrap();
        let nx = vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER | PageFlags::NO_EXECUTE);
        if caps.has(Capability::NxBit) {
            assert_eq!(nx, Ok(()));
        } else {
            assert_eq!(nx.map_err(HalError::from), Err(HalError::NotSupported));
            vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER).unwrap();
        }
        let m = vmm.query(dir, USER_PAGE).unwrap();
        assert_eq!(m.tables_walked, caps.page_table_levels, "{}", P::NAME);
        assert_eq!(m.level, 0);
        assert_eq!(m.flags.contains(PageFlags::NO_EXECUTE), caps.has_nx_bit);
    });
}

#[test]
fn vmm_agrees_with_capabilities_all_arches() {
    vmm_agrees_with_capabilities::<I686>();
    vmm_agrees_with_capabilities::<X86_64>();
    vmm_agrees_with_capabilities::<Aarch64>();
}

fn cow_oom_under<P: Platform>(policy: CowOomPolicy, user_write: u64) -> FaultOutcome {
    let ram = SimRam::new(64);
    let pmm = ram.pmm();
    let mmu = SoftMmu::new();
    let vmm = Vmm::<P, _>::bootstrap(&pmm, &mmu, ram.window()).unwrap();
    let parent = vmm.create_page_directory().unwrap();
    let frame = pmm.alloc_frame().unwrap();
    vmm.map_page_in_directory(parent, USER_PAGE, frame, user_rw::<P>()).unwrap();
    let child = vmm.clone_page_directory(parent).unwrap();
    unsafe { vmm.switch_page_directory(child) }.unwrap();
    while pmm.alloc_frame().is_some() {}

    assert_eq!(
        vmm.handle_cow_page_fault(USER_PAGE, FaultCode::PRESENT | FaultCode::WRITE | FaultCode::USER),
        Err(crate::memory::CowError::OutOfMemory)
    );
    let cfg = KernelConfig { cow_oom: policy, ..KernelConfig::DEFAULT };
    handle_page_fault(&vmm, USER_PAGE, user_write, &cfg)
}

#[test]
fn cow_oom_policy_is_honoured_on_every_arch() {
    for (policy, expected) in [
        (CowOomPolicy::Halt, FaultOutcome::Halt),
        (CowOomPolicy::KillTask, FaultOutcome::KillTask),
    ] {
        assert_eq!(cow_oom_under::<I686>(policy, X86_USER_WRITE), expected);
        assert_eq!(cow_oom_under::<X86_64>(policy, X86_USER_WRITE), expected);
        assert_eq!(cow_oom_under::<Aarch64>(policy, ARM_USER_WRITE), expected);
    }
}

#[test]
fn map_errors_surface_as_hal_errors() {
    with_vmm::<X86_64>(64, |_, vmm| {
        let dir = vmm.create_page_directory().unwrap();
        let f = vmm.pmm().alloc_frame().unwrap();
        vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER_DATA).unwrap();
        let again = vmm.map_page_in_directory(dir, USER_PAGE, f, PageFlags::USER_DATA);
        assert_eq!(again, Err(MapError::AlreadyMapped));
        assert_eq!(again.map_err(HalError::from), Err(HalError::AlreadyExists));
        assert_eq!(HalError::AlreadyExists.errno(), errno::EEXIST);
    });
}

// ── Syscall round trip ──────────────────────────────────────────

const SYS_MIX: usize = 2;
const SYS_FAIL: usize = 3;

/// Weighted sum, so swapped arguments show up.
fn sys_mix(a: &[usize; 6]) -> HalResult<usize> {
    Ok(a.iter().enumerate().map(|(i, v)| v * (i + 1)).sum())
}

fn sys_fail(_: &[usize; 6]) -> HalResult<usize> {
    Err(HalError::NoMemory)
}

fn syscall_round_trip<P: Platform>(load: impl Fn(&mut P::Context, usize, [usize; 6])) {
    let mut table = SyscallTable::<8>::new();
    table.register(SYS_MIX, sys_mix).unwrap();
    table.register(SYS_FAIL, sys_fail).unwrap();

    let mut ctx = P::Context::default();
    load(&mut ctx, SYS_MIX, [1, 2, 3, 4, 5, 6]);
    assert_eq!(table.dispatch::<P>(&mut ctx), 91, "{}", P::NAME);
    assert_eq!(P::return_value(&ctx), 91);

    load(&mut ctx, SYS_FAIL, [0; 6]);
    assert_eq!(table.dispatch::<P>(&mut ctx), -(errno::ENOMEM as isize), "{}", P::NAME);

    load(&mut ctx, 7, [0; 6]);
    assert_eq!(table.dispatch::<P>(&mut ctx), -(errno::ENOSYS as isize), "{}", P::NAME);
}

#[test]
fn syscall_round_trip_all_arches() {
    syscall_round_trip::<I686>(|c, nr, a| {
        c.eax = nr as u32;
        [c.ebx, c.ecx, c.edx, c.esi, c.edi, c.ebp] = a.map(|v| v as u32);
    });
    syscall_round_trip::<X86_64>(|c, nr, a| {
        c.rax = nr as u64;
        [c.rdi, c.rsi, c.rdx, c.r10, c.r8, c.r9] = a.map(|v| v as u64);
    });
    syscall_round_trip::<Aarch64>(|c, nr, a| {
        c.x[8] = nr as u64;
        for (reg, v) in c.x.iter_mut().zip(a) {
            *reg = v as u64;
        }
    });
}
