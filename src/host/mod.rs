//! Local host side of a backup: finding attached devices and copying them.

pub mod copier;
pub mod device;

pub use copier::{BlockCopier, CopyReport, DdCopier};
pub use device::{
    ByIdResolver, DeviceResolver, HostDeviceResolver, SerialResolver, resolve_device,
    serial_fragment,
};
