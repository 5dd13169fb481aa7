//! The character-device switch.
//!
//! Device inodes carry a major number; reads and writes on them
//! dispatch through this table. Major 1 is the console.

use once_slot::OnceSlot;
use osmium_params::NDEV;

use crate::console;
use crate::error::KernelError;

/// The console's major device number, baked into `/dev` nodes by init.
pub const CONSOLE_MAJOR: i16 = 1;

/// Entry points of one character device. The `bool` selects user or
/// kernel addresses, as everywhere else in the copy plumbing.
pub struct DeviceOps {
    pub read: fn(user_dst: bool, dst: usize, n: usize) -> Result<usize, KernelError>,
    pub write: fn(user_src: bool, src: usize, n: usize) -> Result<usize, KernelError>,
}

static DEVICES: [OnceSlot<DeviceOps>; NDEV] = [const { OnceSlot::new() }; NDEV];

/// Registers the built-in devices.
pub fn init() {
    register(
        CONSOLE_MAJOR,
        DeviceOps {
            read: console::read,
            write: console::write,
        },
    );
}

/// Claims a major number. Double registration is a boot bug and panics.
pub fn register(major: i16, ops: DeviceOps) {
    let slot = usize::try_from(major)
        .ok()
        .filter(|&m| m < NDEV)
        .expect("bad major device number");
    DEVICES[slot].set(ops);
}

/// The ops for `major`, if such a device exists.
pub fn get(major: i16) -> Result<&'static DeviceOps, KernelError> {
    usize::try_from(major)
        .ok()
        .filter(|&m| m < NDEV)
        .and_then(|m| DEVICES[m].try_get())
        .ok_or(KernelError::NoSuchDevice)
}
