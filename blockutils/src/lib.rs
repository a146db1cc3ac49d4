pub mod blkid;
pub mod blockdev;
pub mod cryptsetup;
pub mod dd;
pub mod dependencies;
pub mod e2fsck;
pub mod e2image;
pub mod fatlabel;
pub mod ident;
pub mod losetup;
pub mod lsblk;
pub mod lvm;
pub mod mkswap;
pub mod mount;
pub mod ntfs;
pub mod parted;
pub mod qemu;
pub mod repeat;
pub mod resize2fs;
pub mod session;
pub mod sfdisk;
pub mod tune2fs;
pub mod udevadm;
pub mod wipefs;
pub mod xfs;
