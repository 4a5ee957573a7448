//! Jailer driver: chroot path conventions, argument builder, hard-link
//! helper, chroot cleanup (spec §4.2). The uid/cgroup arithmetic is
//! grounded on `examples/auser-mvm/crates/mvm-runtime/src/security/jailer.rs`
//! (`compute_uid`, `launch_jailed` hard-linking kernel/rootfs into a jail
//! root); here the uid itself comes from the registry's `next_jail_uid`
//! allocator rather than being derived, since the spec assigns it that way.

use std::path::{Path, PathBuf};

use crate::error::{ctor, Result};
use crate::exec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Detect cgroup v1 vs v2 by inspecting the filesystem magic of
/// `/sys/fs/cgroup` (magic `0x63677270` = v2, spec §4.2).
pub fn detect_cgroup_version() -> CgroupVersion {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    const CGROUP2_SUPER_MAGIC: i64 = 0x63677270;

    let path = match CString::new("/sys/fs/cgroup") {
        Ok(p) => p,
        Err(_) => return CgroupVersion::V2,
    };

    unsafe {
        let mut stat: MaybeUninit<libc::statfs> = MaybeUninit::uninit();
        let rc = libc::statfs(path.as_ptr(), stat.as_mut_ptr());
        if rc != 0 {
            return CgroupVersion::V2;
        }
        let stat = stat.assume_init();
        if stat.f_type as i64 == CGROUP2_SUPER_MAGIC {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }
}

pub struct JailerPaths {
    pub chroot_root: PathBuf,
}

impl JailerPaths {
    /// Chroot root for a VM = `<base>/firecracker/<vm_id>/root` (spec §4.2).
    pub fn new(chroot_base: &Path, vm_id: &str) -> Self {
        Self { chroot_root: chroot_base.join("firecracker").join(vm_id).join("root") }
    }

    pub fn vm_dir(chroot_base: &Path, vm_id: &str) -> PathBuf {
        chroot_base.join("firecracker").join(vm_id)
    }

    pub fn kernel_link(&self) -> PathBuf {
        self.chroot_root.join("vmlinux")
    }

    pub fn rootfs_link(&self) -> PathBuf {
        self.chroot_root.join("rootfs.ext4")
    }

    pub fn overlay_link(&self) -> PathBuf {
        self.chroot_root.join("overlay.ext4")
    }

    pub fn api_socket(&self) -> PathBuf {
        self.chroot_root.join("api.socket")
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.chroot_root.join("snapshot_file")
    }

    pub fn mem_file(&self) -> PathBuf {
        self.chroot_root.join("mem_file")
    }
}

/// Memory limit floor = `defaultMemSizeMb + 128` MiB (spec §4.2).
pub fn memory_limit_bytes(mem_size_mib: u32) -> u64 {
    (mem_size_mib as u64 + 128) * 1024 * 1024
}

/// CPU quota = `vcpu_count * 100_000` with period `100_000` (spec §4.2).
pub fn cpu_quota_period(vcpu_count: u32) -> (u64, u64) {
    (vcpu_count as u64 * 100_000, 100_000)
}

/// Build the `k=v` cgroup directives for the detected version.
pub fn cgroup_kv_pairs(version: CgroupVersion, vcpu_count: u32, mem_size_mib: u32) -> Vec<String> {
    let mem_bytes = memory_limit_bytes(mem_size_mib);
    let (quota, period) = cpu_quota_period(vcpu_count);
    match version {
        CgroupVersion::V2 => vec![format!("memory.max={}", mem_bytes), format!("cpu.max={} {}", quota, period)],
        CgroupVersion::V1 => vec![
            format!("memory.limit_in_bytes={}", mem_bytes),
            format!("cpu.cfs_quota_us={}", quota),
            format!("cpu.cfs_period_us={}", period),
        ],
    }
}

/// Build the jailer's argv (spec §4.2):
/// `<jailer-binary> --id <vm_id> --exec-file <vmm-binary> --uid <u> --gid <u>
///  --chroot-base-dir <base> [--cgroup-version <1|2>] [--cgroup <k=v> ...] -- --api-sock api.socket`
pub fn build_args(
    jailer_bin: &str,
    vm_id: &str,
    vmm_bin: &str,
    uid: u32,
    chroot_base: &Path,
    version: CgroupVersion,
    vcpu_count: u32,
    mem_size_mib: u32,
) -> Vec<String> {
    let mut args = vec![
        jailer_bin.to_string(),
        "--id".into(),
        vm_id.to_string(),
        "--exec-file".into(),
        vmm_bin.to_string(),
        "--uid".into(),
        uid.to_string(),
        "--gid".into(),
        uid.to_string(),
        "--chroot-base-dir".into(),
        chroot_base.display().to_string(),
    ];
    args.push("--cgroup-version".into());
    args.push(match version { CgroupVersion::V1 => "1".into(), CgroupVersion::V2 => "2".into() });
    for kv in cgroup_kv_pairs(version, vcpu_count, mem_size_mib) {
        args.push("--cgroup".into());
        args.push(kv);
    }
    args.push("--".into());
    args.push("--api-sock".into());
    args.push("api.socket".into());
    args
}

/// Hard-link kernel, rootfs, overlay into the chroot as `/vmlinux`,
/// `/rootfs.ext4`, `/overlay.ext4`, then chown the writable overlay to
/// `jail_uid:jail_uid`.
pub async fn link_chroot_files(
    paths: &JailerPaths,
    kernel: &Path,
    rootfs: &Path,
    overlay: &Path,
    jail_uid: u32,
) -> Result<()> {
    tokio::fs::create_dir_all(&paths.chroot_root)
        .await
        .map_err(|e| ctor::jailer_setup_failed(format!("mkdir chroot root: {}", e)))?;

    for (src, dst) in [(kernel, paths.kernel_link()), (rootfs, paths.rootfs_link()), (overlay, paths.overlay_link())] {
        let _ = tokio::fs::remove_file(&dst).await;
        tokio::fs::hard_link(src, &dst)
            .await
            .map_err(|e| ctor::jailer_setup_failed(format!("hard-link {} -> {}: {}", src.display(), dst.display(), e)))?;
    }

    exec::must("chown", &[&format!("{}:{}", jail_uid, jail_uid), &paths.overlay_link().display().to_string()])
        .await
        .map_err(|e| ctor::jailer_setup_failed(e.message))?;

    Ok(())
}

/// Remove `<base>/firecracker/<vm_id>`. Missing directory is success.
pub async fn cleanup_chroot(chroot_base: &Path, vm_id: &str) -> Result<()> {
    let dir = JailerPaths::vm_dir(chroot_base, vm_id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ctor::jailer_setup_failed(format!("cleanup_chroot {}: {}", dir.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_has_128mib_floor() {
        assert_eq!(memory_limit_bytes(1024), (1024 + 128) * 1024 * 1024);
    }

    #[test]
    fn cpu_quota_is_one_cpu_per_vcpu() {
        assert_eq!(cpu_quota_period(2), (200_000, 100_000));
        assert_eq!(cpu_quota_period(1), (100_000, 100_000));
    }

    #[test]
    fn cgroup_v2_pairs() {
        let pairs = cgroup_kv_pairs(CgroupVersion::V2, 2, 1024);
        assert!(pairs[0].starts_with("memory.max="));
        assert!(pairs[1].starts_with("cpu.max=200000 100000"));
    }

    #[test]
    fn cgroup_v1_pairs() {
        let pairs = cgroup_kv_pairs(CgroupVersion::V1, 1, 512);
        assert_eq!(pairs.len(), 3);
        assert!(pairs[0].starts_with("memory.limit_in_bytes="));
    }

    #[test]
    fn build_args_places_api_sock_after_separator() {
        let args = build_args(
            "/usr/bin/jailer",
            "vm-alpha",
            "/usr/bin/firecracker",
            10_000,
            Path::new("/var/lib/lobsterd/jailer"),
            CgroupVersion::V2,
            2,
            1024,
        );
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "--api-sock");
        assert_eq!(args[sep + 2], "api.socket");
    }

    #[test]
    fn chroot_root_matches_spec_convention() {
        let p = JailerPaths::new(Path::new("/var/lib/lobsterd/jailer"), "vm-alpha");
        assert_eq!(p.chroot_root, PathBuf::from("/var/lib/lobsterd/jailer/firecracker/vm-alpha/root"));
    }
}
