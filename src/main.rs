//! Command-line entry point: parse arguments, mount `/dev/fuse`, drop
//! privileges, and hand off to the session loop.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use clap::Parser;
use nix::mount::{mount, MsFlags};
use nix::unistd::{setgid, setuid, Gid, Uid};

use sdcardfs::{fixup, BootstrapError, Policy, Session};

/// Re-export a host directory through FUSE with fixed ownership and
/// permission bits.
#[derive(Parser, Debug)]
#[command(name = "sdcardfs", version, about)]
struct Args {
    /// Host directory to re-export.
    source: PathBuf,

    /// Where to mount the filesystem.
    mountpoint: PathBuf,

    /// uid every file and directory is reported as owned by; must be
    /// nonzero.
    #[arg(long)]
    uid: Option<u32>,

    /// gid every file and directory is reported as owned by; must be
    /// nonzero.
    #[arg(long)]
    gid: Option<u32>,

    /// Force new file names to lower case and fold produced paths to
    /// lower case.
    #[arg(long)]
    lower_case: bool,

    /// Run the offline ownership/case fix-up walk before mounting.
    #[arg(long)]
    fix_files: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), BootstrapError> {
    let args = Args::parse();

    let uid = args
        .uid
        .filter(|&u| u != 0)
        .ok_or_else(|| BootstrapError::InvalidArgument("uid must be supplied and nonzero".into()))?;
    let gid = args
        .gid
        .filter(|&g| g != 0)
        .ok_or_else(|| BootstrapError::InvalidArgument("gid must be supplied and nonzero".into()))?;

    if args.fix_files {
        log::info!("running fix-up walk over {}", args.source.display());
        fixup::run(&args.source, uid, gid)?;
    }

    let dev_fuse = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/fuse")?;
    let fd = dev_fuse.as_raw_fd();

    let data =
        format!("fd={fd},rootmode=40000,default_permissions,allow_other,user_id={uid},group_id={gid}");
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    mount(
        Some("sdcardfs"),
        &args.mountpoint,
        Some("fuse"),
        flags,
        Some(data.as_str()),
    )?;
    log::info!("mounted {} on {}", args.source.display(), args.mountpoint.display());

    setgid(Gid::from_raw(gid))?;
    setuid(Uid::from_raw(uid))?;

    let policy = Policy {
        force_lower_case: args.lower_case,
        sdcard_gid: gid,
        mount_uid: uid,
        mount_gid: gid,
    };

    // The channel descriptor is kept alive for the lifetime of the session
    // by leaking `dev_fuse`'s ownership into the raw fd the session holds.
    let channel_fd = dev_fuse.as_raw_fd();
    std::mem::forget(dev_fuse);

    let mut session = Session::new(channel_fd, args.source.into_os_string(), policy);
    session.run().map_err(|err| BootstrapError::InvalidArgument(err.to_string()))
}
