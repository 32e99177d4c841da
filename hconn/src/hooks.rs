//! Process-wide system hooks.
//!
//! The connection manager reaches the socket layer through a swappable
//! function table. The default entry is the real socket-channel factory;
//! tests replace the whole table to inject synthetic channels or synchronous
//! failures. The table must be swapped before any concurrent `connect` call:
//! replacement is not ordered against in-flight operations.

use std::sync::Arc;

use hconn_chan::{new_socket_channel, ChannelError, SocketChannelOptions};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub type NewSocketChannelFn =
    Arc<dyn Fn(SocketChannelOptions) -> Result<(), ChannelError> + Send + Sync>;

/// Swappable table of system entry points.
#[derive(Clone)]
pub struct SystemVtable {
    pub new_socket_channel: NewSocketChannelFn,
}

impl Default for SystemVtable {
    fn default() -> Self {
        Self {
            new_socket_channel: Arc::new(new_socket_channel),
        }
    }
}

static SYSTEM_VTABLE: Lazy<RwLock<SystemVtable>> =
    Lazy::new(|| RwLock::new(SystemVtable::default()));

/// Replace the process-wide system vtable. Intended for tests only.
pub fn set_system_vtable(vtable: SystemVtable) {
    *SYSTEM_VTABLE.write() = vtable;
}

/// Restore the default system vtable.
pub fn reset_system_vtable() {
    set_system_vtable(SystemVtable::default());
}

pub(crate) fn system_vtable() -> SystemVtable {
    SYSTEM_VTABLE.read().clone()
}
