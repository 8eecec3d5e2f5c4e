//! Owns the kernel channel, the node table, the handle table, and the
//! policy, and drives the read-dispatch-write loop.

use std::ffi::OsString;
use std::os::unix::io::RawFd;

use crate::abi::BUFFER_SIZE;
use crate::codec;
use crate::dispatch::{self, Context};
use crate::error::FatalError;
use crate::handle::HandleTable;
use crate::node::NodeTable;
use crate::policy::Policy;

pub struct Session {
    channel_fd: RawFd,
    nodes: NodeTable,
    handles: HandleTable,
    policy: Policy,
}

impl Session {
    pub fn new(channel_fd: RawFd, root_host_path: OsString, policy: Policy) -> Session {
        Session {
            channel_fd,
            nodes: NodeTable::new(root_host_path),
            handles: HandleTable::new(),
            policy,
        }
    }

    /// Drive the loop until the channel read fails for a reason other than
    /// `EINTR` (unmount, or a fatal framing error).
    pub fn run(&mut self) -> Result<(), FatalError> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match codec::read_request(self.channel_fd, &mut buf)? {
                Some(n) => n,
                None => {
                    log::info!("channel closed, unmounting");
                    return Ok(());
                }
            };

            let message = codec::parse_message(&buf, n)?;
            let mut ctx = Context {
                channel_fd: self.channel_fd,
                nodes: &mut self.nodes,
                handles: &mut self.handles,
                policy: &self.policy,
            };
            if let Err(err) = dispatch::dispatch(&mut ctx, &message) {
                log::warn!("reply write failed: {err}");
            }
        }
    }
}
