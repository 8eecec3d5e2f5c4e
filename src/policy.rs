//! The fixed ownership/permission policy threaded through the session
//! instead of being exposed as mutable process-wide globals.

/// Overrides applied on every attribute reply and create operation.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Force new file names to lower case, and fold produced paths to
    /// lower case in place (ASCII only).
    pub force_lower_case: bool,
    /// Group id every file and directory is reported as owned by.
    pub sdcard_gid: u32,
    /// uid the process drops privileges to before serving requests.
    pub mount_uid: u32,
    /// gid the process drops privileges to before serving requests.
    pub mount_gid: u32,
}
