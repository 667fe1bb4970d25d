//! Integration tests for the container creation pass.
mod common;

use std::error::Error;
use std::path::{Path, PathBuf};

use common::{Call, Fixture, NO_OVERLAY, OVERLAY, engine, quiet_config};
use strata::config::{FileConfig, MountDev};
use strata::image::{Image, ImageType, Partition, PartitionRole};
use strata::mount::{MountFlags, MountTag};
use strata::rpc::ChrootMethod;
use strata::session::Layout;
use strata_common::StrataError;
use strata_oci::runtime::NamespaceType;

#[test_log::test]
fn squashfs_without_overlay_skips_missing_bind() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let image_path = fx.image_file("image.sqfs", 4096);
    let host_data = fx.path("data");
    std::fs::create_dir(&host_data)?;

    let mut ops = fx.ops();
    ops.images.insert((image_path.clone(), 0), fx.tree.clone());
    let mut engine = engine(Image::new(&image_path, ImageType::Squashfs, 0, 4096));
    engine.bind_path = vec![format!("{}:/nonexistent/path", host_data.display())];

    let mut container = fx.build(ops, engine, quiet_config(), NO_OVERLAY);
    assert_eq!(container.layout(), Layout::None);
    container.create(4242)?;

    let skipped = container.mounter().skipped().clone();
    assert_eq!(skipped.len(), 1);
    assert!(skipped.contains(Path::new("/nonexistent/path")));

    let (ops, session) = container.into_parts();
    let rootfs = session.rootfs_path();
    let (source, _, flags) = ops
        .mounts()
        .into_iter()
        .find(|(_, target, _)| *target == rootfs)
        .ok_or("rootfs not mounted")?;
    assert_eq!(source, PathBuf::from("/dev/loop0"));
    assert!(flags.contains(MountFlags::RDONLY));
    assert!(ops.calls.contains(&Call::Loop(image_path, 0)));
    assert_eq!(
        ops.calls.last(),
        Some(&Call::Chroot(session.final_path(), ChrootMethod::Pivot))
    );

    // identity files derived from the image, the caller appended
    let passwd = std::fs::read_to_string(session.path().join("passwd"))?;
    assert!(passwd.starts_with("root:x:0:0:"));
    assert!(passwd.contains("alice:x:1000:1000:"));
    Ok(())
}

fn sif(fx: &Fixture) -> Image {
    let path = fx.image_file("image.sif", 3 * 4096);
    Image {
        name: "image.sif".to_string(),
        path,
        image_type: ImageType::Sif,
        offset: 0,
        size: 3 * 4096,
        writable: true,
        partitions: vec![
            Partition {
                fs_type: ImageType::Squashfs,
                role: PartitionRole::System,
                offset: 0,
                size: 4096,
            },
            Partition {
                fs_type: ImageType::Ext3,
                role: PartitionRole::Overlay,
                offset: 4096,
                size: 4096,
            },
            Partition {
                fs_type: ImageType::Ext3,
                role: PartitionRole::Overlay,
                offset: 8192,
                size: 4096,
            },
        ],
        fd: None,
    }
}

#[test_log::test]
fn writable_sif_overlays_its_partitions() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let image = sif(&fx);
    let mut ops = fx.ops();
    ops.images.insert((image.path.clone(), 0), fx.tree.clone());
    let mut engine = engine(image.clone());
    engine.writable = true;

    let mut container = fx.build(ops, engine, quiet_config(), OVERLAY);
    assert_eq!(container.layout(), Layout::Overlay);
    container.create(4242)?;
    let (ops, session) = container.into_parts();

    let s = session.path();
    let partition = |n: usize| s.join(format!("overlay-images/partition-{n}"));
    assert!(ops.calls.contains(&Call::Loop(image.path.clone(), 4096)));
    assert!(ops.calls.contains(&Call::Loop(image.path.clone(), 8192)));

    let mounts = ops.mounts();
    let flags_of = |target: &Path| {
        mounts
            .iter()
            .find(|(_, t, _)| t == target)
            .map(|(_, _, flags)| *flags)
    };
    assert!(flags_of(&partition(0)).is_some_and(|f| f.contains(MountFlags::RDONLY)));
    assert!(flags_of(&partition(1)).is_some_and(|f| !f.contains(MountFlags::RDONLY)));

    let overlay = ops
        .position(|c| matches!(c, Call::Mount { fstype: Some(fs), .. } if fs == "overlay"))
        .ok_or("overlay not mounted")?;
    let Call::Mount { target, data, .. } = &ops.calls[overlay] else {
        unreachable!()
    };
    assert_eq!(*target, session.final_path());
    assert_eq!(
        *data,
        format!(
            "lowerdir={}:{}:{},upperdir={},workdir={}",
            partition(0).join("upper").display(),
            s.join("overlay-lowerdir").display(),
            s.join("rootfs").display(),
            partition(1).join("upper").display(),
            partition(1).join("work").display(),
        )
    );

    // upper and work exist before the overlay is assembled
    let upper = ops
        .position(|c| *c == Call::Mkdir(partition(1).join("upper")))
        .ok_or("upper not created")?;
    let work = ops
        .position(|c| *c == Call::Mkdir(partition(1).join("work")))
        .ok_or("work not created")?;
    assert!(upper < overlay && work < overlay);
    Ok(())
}

#[test]
fn pivot_failure_falls_back_to_move_once() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let mut ops = fx.ops();
    ops.fail_pivot = true;
    let mut container = fx.build(ops, engine(Image::sandbox(&fx.tree)), quiet_config(), NO_OVERLAY);
    container.create(4242)?;

    let (ops, session) = container.into_parts();
    let chroots: Vec<&Call> = ops
        .calls
        .iter()
        .filter(|c| matches!(c, Call::Chroot(..)))
        .collect();
    assert_eq!(
        chroots,
        vec![
            &Call::Chroot(session.final_path(), ChrootMethod::Pivot),
            &Call::Chroot(session.final_path(), ChrootMethod::Move),
        ]
    );
    Ok(())
}

#[test]
fn root_switch_failure_is_fatal() {
    let fx = Fixture::new();
    let mut ops = fx.ops();
    ops.fail_pivot = true;
    ops.fail_move = true;
    let mut container = fx.build(ops, engine(Image::sandbox(&fx.tree)), quiet_config(), NO_OVERLAY);

    let err = container.create(4242).unwrap_err();
    assert!(matches!(err, StrataError::Mount { ref what, .. } if what == "root filesystem"));
}

#[test]
fn user_binds_use_caller_credentials() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let hosts = fx.path("hosts");
    std::fs::write(&hosts, "10.0.0.1 node\n")?;
    let data = fx.path("data");
    std::fs::create_dir(&data)?;

    let config = FileConfig {
        bind_path: vec![format!("{}:/etc/hosts", hosts.display())],
        ..quiet_config()
    };
    let mut engine = engine(Image::sandbox(&fx.tree));
    engine.bind_path = vec![format!("{}:/mnt/data:ro", data.display())];

    let mut container = fx.build(fx.ops(), engine, config, NO_OVERLAY);
    container.create(4242)?;
    assert!(container.mounter().skipped().is_empty());
    let (ops, session) = container.into_parts();

    let final_hosts = session.final_join(Path::new("/etc/hosts"));
    let final_data = session.final_join(Path::new("/mnt/data"));
    let mounted = |target: &PathBuf| {
        ops.position(|c| matches!(c, Call::Mount { target: t, source, .. } if t == target && !source.as_os_str().is_empty()))
    };
    let admin = mounted(&final_hosts).ok_or("admin bind missing")?;
    let user = mounted(&final_data).ok_or("user bind missing")?;
    let switch = ops.position(|c| *c == Call::FsId(1000, 1000)).ok_or("no switch")?;
    let restore = ops.position(|c| *c == Call::FsId(0, 0)).ok_or("no restore")?;
    assert!(admin < switch && switch < user && user < restore);

    // the read-only user bind is remounted with its flags
    let remount = ops
        .mounts()
        .into_iter()
        .find(|(_, t, f)| *t == final_data && f.contains(MountFlags::REMOUNT))
        .ok_or("user bind not remounted")?;
    assert!(remount.2.contains(MountFlags::RDONLY | MountFlags::BIND));
    Ok(())
}

#[test]
fn duplicate_destination_keeps_first_bind() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let (a, b) = (fx.path("a"), fx.path("b"));
    std::fs::create_dir(&a)?;
    std::fs::create_dir(&b)?;
    let mut engine = engine(Image::sandbox(&fx.tree));
    engine.bind_path = vec![
        format!("{}:/mnt/data", a.display()),
        format!("{}:/mnt/data", b.display()),
    ];

    let mut container = fx.build(fx.ops(), engine, quiet_config(), NO_OVERLAY);
    container.add_mount_points()?;
    let points = &container.system().points;
    let point = points
        .get_by_destination(Path::new("/mnt/data"))
        .ok_or("bind missing")?;
    assert_eq!(point.source, a);
    assert_eq!(
        points
            .get_by_tag(MountTag::Userbinds)
            .filter(|p| p.destination == Path::new("/mnt/data"))
            .count(),
        1
    );
    Ok(())
}

#[test]
fn underlay_creates_missing_destinations() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let data = fx.path("data");
    std::fs::create_dir(&data)?;
    let config = FileConfig {
        enable_underlay: true,
        config_passwd: false,
        config_group: false,
        ..quiet_config()
    };
    let mut engine = engine(Image::sandbox(&fx.tree));
    engine.bind_path = vec![format!("{}:/opt/missing", data.display())];

    let mut container = fx.build(fx.ops(), engine, config, NO_OVERLAY);
    assert_eq!(container.layout(), Layout::Underlay);
    container.create(4242)?;
    assert!(container.mounter().skipped().is_empty());

    let (ops, session) = container.into_parts();
    let final_path = session.final_path();
    assert!(final_path.join("opt/missing").is_dir());
    let mounts = ops.mounts();
    assert!(mounts.iter().any(|(s, t, _)| *s == session.rootfs_path().join("bin") && *t == final_path.join("bin")));
    assert!(mounts.iter().any(|(s, t, _)| *s == data && *t == final_path.join("opt/missing")));
    Ok(())
}

#[test]
fn host_root_is_refused() {
    let fx = Fixture::new();
    let mut container = fx.build(fx.ops(), engine(Image::sandbox("/")), quiet_config(), NO_OVERLAY);
    let err = container.add_mount_points().unwrap_err();
    assert!(matches!(err, StrataError::Mount { ref what, .. } if what == "root filesystem"));
}

#[test]
fn user_bind_replaces_dev() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let devices = fx.path("devices");
    std::fs::create_dir(&devices)?;
    let config = FileConfig {
        mount_dev: MountDev::Minimal,
        ..quiet_config()
    };
    let mut engine = engine(Image::sandbox(&fx.tree));
    engine.bind_path = vec![format!("{}:/dev", devices.display())];

    let mut container = fx.build(fx.ops(), engine, config, NO_OVERLAY);
    container.add_mount_points()?;
    let points = &container.system().points;
    assert_eq!(points.get_by_tag(MountTag::Dev).count(), 0);
    let dev = points
        .get_by_destination(Path::new("/dev"))
        .ok_or("/dev bind missing")?;
    assert_eq!(dev.tag, MountTag::Userbinds);
    assert_eq!(dev.source, devices);
    Ok(())
}

/// Fstype and flags of the `/proc` mount of a pass in a PID namespace.
fn proc_mount(shared: Vec<NamespaceType>) -> Result<(Option<String>, MountFlags, PathBuf), Box<dyn Error>> {
    let fx = Fixture::new();
    let config = FileConfig {
        mount_proc: true,
        mount_sys: false,
        mount_dev: MountDev::No,
        ..quiet_config()
    };
    let mut engine = engine(Image::sandbox(&fx.tree));
    engine.oci.add_namespace(NamespaceType::Pid, None);
    let mut ops = fx.ops();
    ops.shared_namespaces = shared;

    let mut container = fx.build(ops, engine, config, NO_OVERLAY);
    container.create(4242)?;
    let (ops, session) = container.into_parts();
    let proc_dir = session.final_join(Path::new("/proc"));
    ops.calls
        .into_iter()
        .find_map(|c| match c {
            Call::Mount {
                source,
                target,
                fstype,
                flags,
                ..
            } if target == proc_dir && !flags.contains(MountFlags::REMOUNT) => Some((fstype, flags, source)),
            _ => None,
        })
        .ok_or_else(|| "no /proc mount".into())
}

#[test]
fn shared_pid_namespace_binds_host_proc() -> Result<(), Box<dyn Error>> {
    let (fstype, _, _) = proc_mount(Vec::new())?;
    assert_eq!(fstype.as_deref(), Some("proc"));

    let (fstype, flags, source) = proc_mount(vec![NamespaceType::Pid])?;
    assert_eq!(fstype, None);
    assert!(flags.contains(MountFlags::BIND | MountFlags::REC));
    assert_eq!(source, PathBuf::from("/proc"));
    Ok(())
}
