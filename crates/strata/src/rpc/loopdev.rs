//! Loop device attachment.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata_common::{StrataError, StrataResult};

use super::LoopArgs;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Device is read-only.
pub const LOOP_FLAG_READ_ONLY: u32 = 1;
/// Detach the device when its last user goes away.
pub const LOOP_FLAG_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// Serializes attaches from this process.
static ATTACH_LOCK: Mutex<()> = Mutex::new(());

/// An attached loop device, kept open so AutoClear does not release it.
#[derive(Debug)]
pub struct LoopDevice {
    /// Device number (`/dev/loop<N>`).
    pub number: u32,
    _file: File,
}

fn device_path(number: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{number}"))
}

fn ioctl_err(what: &str, number: u32) -> StrataError {
    let err = std::io::Error::last_os_error();
    tracing::debug!(device = number, error = %err, "{what} failed");
    StrataError::Io(err)
}

fn get_status(file: &File) -> Option<LoopInfo64> {
    let mut info = LoopInfo64::zeroed();
    // Safety: info is a properly sized loop_info64 buffer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), LOOP_GET_STATUS64 as _, &raw mut info) };
    (ret == 0).then_some(info)
}

fn open_device(number: u32, writable: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(writable)
        .open(device_path(number))
}

/// Find a device already attached to the same image extent.
fn find_shared(args: &LoopArgs, image: &File, writable: bool) -> StrataResult<Option<LoopDevice>> {
    let meta = image.metadata()?;
    for number in 0..args.max_devices {
        let Ok(file) = open_device(number, writable) else {
            continue;
        };
        let Some(info) = get_status(&file) else {
            continue;
        };
        if info.lo_device == meta.dev()
            && info.lo_inode == meta.ino()
            && info.lo_offset == args.info.offset
            && info.lo_sizelimit == args.info.size_limit
        {
            tracing::debug!(device = number, image = %args.image.display(), "Reusing loop device");
            return Ok(Some(LoopDevice {
                number,
                _file: file,
            }));
        }
    }
    Ok(None)
}

fn next_free() -> Option<u32> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")
        .ok()?;
    // Safety: LOOP_CTL_GET_FREE takes no argument.
    let ret = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
    u32::try_from(ret).ok()
}

fn file_name(path: &Path) -> [u8; LO_NAME_SIZE] {
    let mut name = [0u8; LO_NAME_SIZE];
    let bytes = path.as_os_str().as_encoded_bytes();
    let len = bytes.len().min(LO_NAME_SIZE - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    name
}

fn try_attach(
    number: u32,
    image: &File,
    args: &LoopArgs,
    writable: bool,
) -> StrataResult<Option<LoopDevice>> {
    let file = match open_device(number, writable) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Safety: both descriptors are valid for the duration of the call.
    if unsafe { libc::ioctl(file.as_raw_fd(), LOOP_SET_FD as _, image.as_raw_fd()) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBUSY) {
            return Ok(None);
        }
        return Err(err.into());
    }

    let mut info = LoopInfo64::zeroed();
    info.lo_offset = args.info.offset;
    info.lo_sizelimit = args.info.size_limit;
    info.lo_flags = args.info.flags | LOOP_FLAG_AUTOCLEAR;
    if !writable {
        info.lo_flags |= LOOP_FLAG_READ_ONLY;
    }
    info.lo_file_name = file_name(&args.image);

    // Safety: info is a properly initialized loop_info64.
    if unsafe { libc::ioctl(file.as_raw_fd(), LOOP_SET_STATUS64 as _, &raw const info) } != 0 {
        let err = ioctl_err("LOOP_SET_STATUS64", number);
        // Safety: detaching the device we just attached.
        unsafe { libc::ioctl(file.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        return Err(err);
    }

    Ok(Some(LoopDevice {
        number,
        _file: file,
    }))
}

/// Attach an image to the next free loop device.
pub fn attach(args: &LoopArgs) -> StrataResult<LoopDevice> {
    let _lock = ATTACH_LOCK.lock();
    let writable = args.mode & libc::O_ACCMODE == libc::O_RDWR;

    let image = OpenOptions::new()
        .read(true)
        .write(writable)
        .open(&args.image)
        .map_err(|e| {
            StrataError::mount(
                format!("loop device for {}", args.image.display()),
                e,
            )
        })?;

    if args.shared {
        if let Some(device) = find_shared(args, &image, writable)? {
            return Ok(device);
        }
    }

    if let Some(number) = next_free().filter(|n| *n < args.max_devices) {
        if let Some(device) = try_attach(number, &image, args, writable)? {
            tracing::debug!(device = number, image = %args.image.display(), "Attached loop device");
            return Ok(device);
        }
    }

    for number in 0..args.max_devices {
        if let Some(device) = try_attach(number, &image, args, writable)? {
            tracing::debug!(device = number, image = %args.image.display(), "Attached loop device");
            return Ok(device);
        }
    }

    Err(StrataError::mount(
        format!("loop device for {}", args.image.display()),
        format!("no free loop device among {}", args.max_devices),
    ))
}

impl LoopDevice {
    /// Path of the device node.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        device_path(self.number)
    }
}
